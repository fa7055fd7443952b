// ============================================================================
// Unit-of-Work Coordinator
// ============================================================================

use crate::connection::DatabaseConnection;
use crate::core::{PersistError, Result};
use crate::identity::IdentityMap;
use crate::task::{
    CommitEffect, DispatchTarget, Operation, RawStatement, Task, TaskDispatcher,
    expand_dependencies,
};
use crate::unit::report::{FlushReport, FlushStatus};
use log::{debug, warn};
use std::sync::{Arc, RwLock};

/// Symbolic reference to one or more named transactions, resolved to a
/// concrete name list at the start of each coordinator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionRef {
    All,
    LastUsed,
    LastCreated,
    Named(String),
    List(Vec<String>),
}

impl TransactionRef {
    pub fn named(name: impl Into<String>) -> Self {
        TransactionRef::Named(name.into())
    }
}

/// What happens to the remaining transactions once one of them fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop; remaining transactions are never attempted but are reported
    /// as rolled back and removed from the live queue.
    Abort,
    /// Attempt every remaining transaction regardless.
    Continue,
}

struct TransactionQueue {
    name: String,
    tasks: Vec<Box<dyn Task>>,
}

/// Owns the named, ordered queues of pending tasks and executes them
/// against the database with commit/rollback semantics.
pub struct UnitOfWork {
    queues: Vec<TransactionQueue>,
    last_created: Option<String>,
    last_used: Option<String>,
    dispatcher: TaskDispatcher,
    identity: Arc<RwLock<IdentityMap>>,
    auto_name: u64,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::with_identity_map(Arc::new(RwLock::new(IdentityMap::new())))
    }

    pub fn with_identity_map(identity: Arc<RwLock<IdentityMap>>) -> Self {
        Self {
            queues: Vec::new(),
            last_created: None,
            last_used: None,
            dispatcher: TaskDispatcher::new(),
            identity,
            auto_name: 0,
        }
    }

    pub fn identity_map(&self) -> Arc<RwLock<IdentityMap>> {
        Arc::clone(&self.identity)
    }

    pub fn transaction_count(&self) -> usize {
        self.queues.len()
    }

    pub fn transaction_names(&self) -> Vec<&str> {
        self.queues.iter().map(|queue| queue.name.as_str()).collect()
    }

    /// Pending task count for one transaction.
    pub fn task_count(&self, name: &str) -> Option<usize> {
        self.index_of(name)
            .map(|index| self.queues[index].tasks.len())
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.queues.iter().position(|queue| queue.name == name)
    }

    /// Create a named queue, or return the existing one when `reuse` is
    /// set. An existing name without `reuse` is an error.
    pub fn new_transaction(&mut self, name: impl Into<String>, reuse: bool) -> Result<String> {
        let name = name.into();
        if self.index_of(&name).is_some() {
            if !reuse {
                return Err(PersistError::TransactionExists(name));
            }
        } else {
            self.queues.push(TransactionQueue {
                name: name.clone(),
                tasks: Vec::new(),
            });
            self.last_created = Some(name.clone());
        }
        self.last_used = Some(name.clone());
        Ok(name)
    }

    fn resolve(&self, reference: &TransactionRef, ignore_missing: bool) -> Result<Vec<String>> {
        let names: Vec<String> = match reference {
            TransactionRef::All => self
                .queues
                .iter()
                .map(|queue| queue.name.clone())
                .collect(),
            TransactionRef::LastUsed => self.resolve_pointer(&self.last_used, "most recently used")?,
            TransactionRef::LastCreated => {
                self.resolve_pointer(&self.last_created, "most recently created")?
            }
            TransactionRef::Named(name) => vec![name.clone()],
            TransactionRef::List(list) => list.clone(),
        };

        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            if self.index_of(&name).is_some() {
                resolved.push(name);
            } else if !ignore_missing {
                return Err(PersistError::TransactionNotFound(name));
            }
        }
        Ok(resolved)
    }

    fn resolve_pointer(&self, pointer: &Option<String>, what: &str) -> Result<Vec<String>> {
        match pointer {
            Some(name) => Ok(vec![name.clone()]),
            None => Err(PersistError::TransactionNotFound(format!("<{}>", what))),
        }
    }

    /// Default enqueue target: the most recently used transaction, creating
    /// one implicitly when none exists.
    fn default_transaction(&mut self) -> String {
        if let Some(name) = &self.last_used {
            if self.index_of(name).is_some() {
                return name.clone();
            }
        }
        loop {
            self.auto_name += 1;
            let name = format!("uow-{}", self.auto_name);
            if self.index_of(&name).is_none() {
                self.queues.push(TransactionQueue {
                    name: name.clone(),
                    tasks: Vec::new(),
                });
                self.last_created = Some(name.clone());
                self.last_used = Some(name.clone());
                return name;
            }
        }
    }

    /// Enqueue a persist for any dispatchable target into the default
    /// transaction.
    pub fn persist(&mut self, target: DispatchTarget) -> Result<&mut Self> {
        self.enqueue(target, Operation::Persist, None)
    }

    pub fn persist_in(
        &mut self,
        target: DispatchTarget,
        reference: &TransactionRef,
    ) -> Result<&mut Self> {
        self.enqueue(target, Operation::Persist, Some(reference))
    }

    pub fn delete(&mut self, target: DispatchTarget) -> Result<&mut Self> {
        self.enqueue(target, Operation::Delete, None)
    }

    pub fn delete_in(
        &mut self,
        target: DispatchTarget,
        reference: &TransactionRef,
    ) -> Result<&mut Self> {
        self.enqueue(target, Operation::Delete, Some(reference))
    }

    /// Enqueue a raw statement into the default transaction.
    pub fn execute_statement(&mut self, statement: RawStatement) -> Result<&mut Self> {
        self.enqueue(statement.into_target(), Operation::Persist, None)
    }

    fn enqueue(
        &mut self,
        target: DispatchTarget,
        operation: Operation,
        reference: Option<&TransactionRef>,
    ) -> Result<&mut Self> {
        let task = self.dispatcher.dispatch(target, operation)?;
        self.enqueue_task(task, reference)
    }

    /// Append a pre-built task (plus its cascade dependencies) to a queue.
    pub fn enqueue_task(
        &mut self,
        task: Box<dyn Task>,
        reference: Option<&TransactionRef>,
    ) -> Result<&mut Self> {
        let name = match reference {
            Some(reference) => {
                let names = self.resolve(reference, false)?;
                match <[String; 1]>::try_from(names) {
                    Ok([name]) => name,
                    Err(_) => {
                        return Err(PersistError::Execution(
                            "enqueue requires a reference resolving to exactly one transaction"
                                .to_string(),
                        ));
                    }
                }
            }
            None => self.default_transaction(),
        };

        let dependencies = expand_dependencies(&*task)?;
        let index = self
            .index_of(&name)
            .expect("enqueue target resolved to a live transaction");
        let queue = &mut self.queues[index];
        queue.tasks.extend(dependencies);
        queue.tasks.push(task);
        self.last_used = Some(name);
        Ok(self)
    }

    /// Drop named queue(s) without executing them. Returns how many
    /// transactions were removed.
    pub fn remove_transaction(
        &mut self,
        reference: &TransactionRef,
        ignore_missing: bool,
    ) -> Result<usize> {
        let names = self.resolve(reference, ignore_missing)?;
        let mut removed = 0usize;
        for name in names {
            if let Some(index) = self.index_of(&name) {
                self.queues.remove(index);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Execute the referenced transactions, one database transaction each,
    /// in order.
    ///
    /// Per transaction: begin, execute tasks in enqueue order, roll back
    /// and re-mark on the first failure, commit otherwise; the transaction
    /// leaves the live queue unconditionally. Under [`FailurePolicy::Abort`]
    /// a failure stops processing and the remaining transactions are
    /// reported rolled back without ever reaching the database. With
    /// `throw_on_error` the first chronological captured error is re-raised
    /// after processing and the report is not returned.
    pub async fn flush(
        &mut self,
        conn: &mut dyn DatabaseConnection,
        reference: &TransactionRef,
        policy: FailurePolicy,
        throw_on_error: bool,
    ) -> Result<FlushReport> {
        let names = self.resolve(reference, false)?;
        debug!("flushing {} transaction(s) with {:?}", names.len(), policy);

        let mut report = FlushReport::new();
        let mut first_error: Option<PersistError> = None;
        let mut abort_rest_from: Option<usize> = None;

        for (position, name) in names.iter().enumerate() {
            let Some(index) = self.index_of(name) else {
                continue;
            };
            let queue = self.queues.remove(index);
            let failure = self
                .run_transaction(conn, name, queue.tasks, &mut report)
                .await?;

            if let Some(error) = failure {
                report.add_error(name, error.clone());
                if first_error.is_none() {
                    first_error = Some(error);
                }
                if policy == FailurePolicy::Abort {
                    abort_rest_from = Some(position + 1);
                    break;
                }
            }
        }

        // Collateral damage under ABORT: the rest never reaches the
        // database but is reported and dequeued as if attempted.
        if let Some(start) = abort_rest_from {
            for name in &names[start..] {
                let Some(index) = self.index_of(name) else {
                    continue;
                };
                let queue = self.queues.remove(index);
                warn!(
                    "transaction '{}' not attempted: earlier failure with abort policy",
                    name
                );
                for task in queue.tasks {
                    report.add(name, Arc::from(task), FlushStatus::RolledBack);
                }
            }
        }

        report.finish();

        if throw_on_error {
            if let Some(error) = first_error {
                return Err(error);
            }
        }
        Ok(report)
    }

    /// Run one transaction's tasks. Returns the captured execution error,
    /// if any; internal map/lock failures propagate as hard errors.
    async fn run_transaction(
        &mut self,
        conn: &mut dyn DatabaseConnection,
        name: &str,
        mut tasks: Vec<Box<dyn Task>>,
        report: &mut FlushReport,
    ) -> Result<Option<PersistError>> {
        debug!("transaction '{}': {} task(s)", name, tasks.len());

        let mut statuses: Vec<FlushStatus> = Vec::with_capacity(tasks.len());
        let mut failure: Option<PersistError> = None;

        match conn.begin().await {
            Ok(()) => {
                let mut index = 0;
                while index < tasks.len() {
                    if failure.is_some() {
                        statuses.push(FlushStatus::RolledBack);
                        index += 1;
                        continue;
                    }
                    match tasks[index].execute(conn).await {
                        Ok(()) => statuses.push(FlushStatus::Success),
                        Err(error) => {
                            warn!("task failed in transaction '{}': {}", name, error);
                            if let Err(rollback_error) = conn.rollback().await {
                                warn!(
                                    "rollback of transaction '{}' failed: {}",
                                    name, rollback_error
                                );
                            }
                            for prior in 0..index {
                                if statuses[prior] == FlushStatus::Success {
                                    statuses[prior] = FlushStatus::RolledBack;
                                    tasks[prior].revert();
                                }
                            }
                            tasks[index].revert();
                            statuses.push(FlushStatus::Failed);
                            failure = Some(error);
                        }
                    }
                    index += 1;
                }

                if failure.is_none() {
                    if let Err(error) = conn.commit().await {
                        warn!("commit of transaction '{}' failed: {}", name, error);
                        if conn.is_in_transaction() {
                            let _ = conn.rollback().await;
                        }
                        for (status, task) in statuses.iter_mut().zip(tasks.iter_mut()) {
                            *status = FlushStatus::RolledBack;
                            task.revert();
                        }
                        failure = Some(error);
                    }
                }
            }
            Err(error) => {
                warn!("could not open transaction '{}': {}", name, error);
                statuses = vec![FlushStatus::RolledBack; tasks.len()];
                failure = Some(error);
            }
        }

        if failure.is_none() {
            let mut map = self.identity.write()?;
            for task in &tasks {
                for effect in task.committed_effects() {
                    apply_effect(&mut map, effect)?;
                }
            }
        }

        for (task, status) in tasks.into_iter().zip(statuses) {
            report.add(name, Arc::from(task), status);
        }
        Ok(failure)
    }
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply one committed task effect to the identity map.
fn apply_effect(map: &mut IdentityMap, effect: CommitEffect) -> Result<()> {
    match effect {
        CommitEffect::EntityPersisted(entity) => {
            if map.is_new(&entity) {
                map.set_new_state(&entity, false)?;
            } else {
                map.rekey(&entity)?;
            }
            entity.write()?.reset_change_tracking();
        }
        CommitEffect::EntityDeleted(entity) => {
            map.detach(&entity)?;
        }
        CommitEffect::LobPersisted(lob) => {
            lob.write()?.mark_persisted();
        }
        CommitEffect::LobDeleted(lob) => {
            let mut guard = lob.write()?;
            guard.clear_handle();
            guard.mark_persisted();
        }
    }
    Ok(())
}
