use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum PersistError {
    #[error("No compatible task for target: {0}")]
    IncompatibleTarget(String),

    #[error("Key collision: {0}")]
    KeyCollision(String),

    #[error("Transaction '{0}' not found")]
    TransactionNotFound(String),

    #[error("Transaction '{0}' already exists")]
    TransactionExists(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Large object error: {0}")]
    Lob(String),

    #[error("Field '{0}' not found on entity '{1}'")]
    FieldNotFound(String, String),

    #[error("Lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, PersistError>;

impl<T> From<std::sync::PoisonError<T>> for PersistError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}
