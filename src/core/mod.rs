pub mod error;
pub mod value;

pub use error::{PersistError, Result};
pub use value::{EntityKey, QuoteContext, Value, sql_escape_string};
