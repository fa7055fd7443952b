// ============================================================================
// RustOrmDB Library
// ============================================================================

pub mod connection;
pub mod core;
pub mod entity;
pub mod identity;
pub mod task;
pub mod unit;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export main types for convenience
pub use connection::{DatabaseConnection, MemoryConnection};
pub use core::{EntityKey, PersistError, QuoteContext, Result, Value};
pub use entity::{
    EntityRef, FieldValue, LargeObject, LobRef, Persistable, entities_same, entity_ref,
};
pub use identity::{IdentityMap, Partition};
pub use task::{
    DispatchTarget, Operation, RawStatement, RenderStatement, Task, TaskDispatcher, TaskKind,
};
pub use unit::{FailurePolicy, FlushReport, FlushStatus, TransactionRef, UnitOfWork};

use std::sync::{Arc, RwLock};

/// Persistence repository: one identity map, one unit of work, one backend
/// connection.
///
/// This is the recommended entry point. Objects are enqueued through the
/// unit of work and written out by `flush`; between flushes the identity
/// map guarantees one live instance per persisted key.
///
/// # Examples
///
/// ```
/// use rustormdb::{FailurePolicy, MemoryConnection, RawStatement, Repository, TransactionRef};
///
/// # tokio_test::block_on(async {
/// let mut repo = Repository::new(MemoryConnection::new());
///
/// repo.new_transaction("setup", false).unwrap();
/// repo.unit_of_work()
///     .execute_statement(RawStatement::new("SET t = 1"))
///     .unwrap();
///
/// let report = repo
///     .flush(&TransactionRef::All, FailurePolicy::Continue, false)
///     .await
///     .unwrap();
/// assert!(report.is_success(None));
/// assert_eq!(repo.connection().var("t"), Some("1"));
/// # });
/// ```
pub struct Repository<C: DatabaseConnection> {
    connection: C,
    identity: Arc<RwLock<IdentityMap>>,
    unit: UnitOfWork,
}

impl<C: DatabaseConnection> Repository<C> {
    /// Open a repository over a backend connection with the default
    /// identity-cache ceiling.
    pub fn new(connection: C) -> Self {
        Self::with_cache_size(connection, identity::DEFAULT_MAX_SIZE)
    }

    /// Open a repository with an explicit identity-cache ceiling.
    pub fn with_cache_size(connection: C, max_size: usize) -> Self {
        let identity = Arc::new(RwLock::new(IdentityMap::with_max_size(max_size)));
        let unit = UnitOfWork::with_identity_map(Arc::clone(&identity));
        Self {
            connection,
            identity,
            unit,
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub fn unit_of_work(&mut self) -> &mut UnitOfWork {
        &mut self.unit
    }

    pub fn identity_map(&self) -> Arc<RwLock<IdentityMap>> {
        Arc::clone(&self.identity)
    }

    /// Create (or with `reuse`, return) a named transaction.
    pub fn new_transaction(&mut self, name: impl Into<String>, reuse: bool) -> Result<String> {
        self.unit.new_transaction(name, reuse)
    }

    /// Enqueue a persist into the most recently used transaction.
    pub fn persist(&mut self, target: DispatchTarget) -> Result<&mut Self> {
        self.unit.persist(target)?;
        Ok(self)
    }

    /// Enqueue a delete into the most recently used transaction.
    pub fn delete(&mut self, target: DispatchTarget) -> Result<&mut Self> {
        self.unit.delete(target)?;
        Ok(self)
    }

    /// Drop pending transactions without executing them.
    pub fn remove_transaction(
        &mut self,
        reference: &TransactionRef,
        ignore_missing: bool,
    ) -> Result<usize> {
        self.unit.remove_transaction(reference, ignore_missing)
    }

    /// Flush the referenced transactions against this repository's
    /// connection.
    pub async fn flush(
        &mut self,
        reference: &TransactionRef,
        policy: FailurePolicy,
        throw_on_error: bool,
    ) -> Result<FlushReport> {
        self.unit
            .flush(&mut self.connection, reference, policy, throw_on_error)
            .await
    }

    /// Flush everything pending.
    pub async fn flush_all(
        &mut self,
        policy: FailurePolicy,
        throw_on_error: bool,
    ) -> Result<FlushReport> {
        self.flush(&TransactionRef::All, policy, throw_on_error).await
    }

    /// Look up a cached entity by its persisted key.
    pub fn find(&self, key: &EntityKey) -> Result<Option<EntityRef>> {
        let mut map = self.identity.write()?;
        Ok(map.get(key))
    }

    /// Attach an entity to the identity cache.
    pub fn attach(&self, entity: &EntityRef) -> Result<Partition> {
        self.identity.write()?.attach(entity)
    }

    /// Evict stale unchanged cache entries over the configured ceiling.
    pub fn garbage_collect(&self) -> Result<usize> {
        self.identity.write()?.garbage_collect()
    }
}
