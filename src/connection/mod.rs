pub mod memory;

use crate::core::Result;
use async_trait::async_trait;

pub use memory::MemoryConnection;

/// Backend connection consumed by the unit of work.
///
/// `commit` and `rollback` map directly onto the backend's transaction
/// primitives; there is no nested or savepoint model. The connection is
/// held for the duration of each open transaction and must not be shared
/// with another flush while one is open.
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Open a transaction. Opening a second one is an error.
    async fn begin(&mut self) -> Result<()>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// Execute one statement, returning the number of affected rows.
    /// Outside a transaction the statement takes effect immediately.
    async fn execute(&mut self, statement: &str) -> Result<u64>;

    fn is_in_transaction(&self) -> bool;
}
