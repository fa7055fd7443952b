// ============================================================================
// Task Dispatcher
// ============================================================================

use crate::core::{PersistError, Result};
use crate::task::{
    BulkTask, DispatchTarget, EntityTask, LobTask, Operation, StatementTask, Task, TaskKind,
};
use std::collections::HashMap;

/// Variant priority, most specific first. The first compatible variant
/// wins.
const PRIORITY: [TaskKind; 4] = [
    TaskKind::Lob,
    TaskKind::Bulk,
    TaskKind::Statement,
    TaskKind::Entity,
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CompatKey {
    shape: &'static str,
    entity_type: Option<&'static str>,
    operation: Operation,
}

enum Selection {
    Found(TaskKind),
    Rejected(Vec<String>),
}

/// Resolves an arbitrary target plus an operation into the first compatible
/// task variant. Compatibility verdicts are cached per concrete target
/// shape, so repeated dispatches of the same entity type skip the predicate
/// walk.
pub struct TaskDispatcher {
    compat_cache: HashMap<CompatKey, TaskKind>,
}

impl TaskDispatcher {
    pub fn new() -> Self {
        Self {
            compat_cache: HashMap::new(),
        }
    }

    /// Resolve or fail with `IncompatibleTarget` carrying every variant's
    /// refusal reason.
    pub fn dispatch(
        &mut self,
        target: DispatchTarget,
        operation: Operation,
    ) -> Result<Box<dyn Task>> {
        match self.select(&target, operation)? {
            Selection::Found(kind) => self.build(kind, target, operation),
            Selection::Rejected(reasons) => Err(PersistError::IncompatibleTarget(format!(
                "{} ({})",
                target.shape_name(),
                reasons.join("; ")
            ))),
        }
    }

    /// Speculative mode: `None` instead of an error when nothing accepts
    /// the target.
    pub fn probe(
        &mut self,
        target: DispatchTarget,
        operation: Operation,
    ) -> Result<Option<Box<dyn Task>>> {
        match self.select(&target, operation)? {
            Selection::Found(kind) => Ok(Some(self.build(kind, target, operation)?)),
            Selection::Rejected(_) => Ok(None),
        }
    }

    pub fn cached_verdicts(&self) -> usize {
        self.compat_cache.len()
    }

    fn select(&mut self, target: &DispatchTarget, operation: Operation) -> Result<Selection> {
        let key = Self::compat_key(target, operation)?;
        if let Some(kind) = self.compat_cache.get(&key) {
            return Ok(Selection::Found(*kind));
        }

        let mut reasons = Vec::new();
        for kind in PRIORITY {
            let verdict = match kind {
                TaskKind::Lob => LobTask::is_compatible(target, operation),
                TaskKind::Bulk => BulkTask::is_compatible(target, operation),
                TaskKind::Statement => StatementTask::is_compatible(target, operation),
                TaskKind::Entity => EntityTask::is_compatible(target, operation),
            };
            match verdict {
                Ok(()) => {
                    self.compat_cache.insert(key, kind);
                    return Ok(Selection::Found(kind));
                }
                Err(reason) => reasons.push(reason),
            }
        }
        Ok(Selection::Rejected(reasons))
    }

    fn compat_key(target: &DispatchTarget, operation: Operation) -> Result<CompatKey> {
        let entity_type = match target {
            DispatchTarget::Entity(entity) => Some(entity.read()?.entity_type()),
            DispatchTarget::Collection(members) => match members.first() {
                Some(first) => Some(first.read()?.entity_type()),
                None => None,
            },
            _ => None,
        };
        Ok(CompatKey {
            shape: target.shape_name(),
            entity_type,
            operation,
        })
    }

    fn build(
        &self,
        kind: TaskKind,
        target: DispatchTarget,
        operation: Operation,
    ) -> Result<Box<dyn Task>> {
        match (kind, target) {
            (TaskKind::Lob, DispatchTarget::Lob(lob)) => {
                Ok(Box::new(LobTask::new(lob, operation)))
            }
            (TaskKind::Bulk, DispatchTarget::Collection(members)) => {
                Ok(Box::new(BulkTask::new(members, operation)?))
            }
            (TaskKind::Statement, DispatchTarget::Statement(statement)) => {
                Ok(Box::new(StatementTask::new(statement, operation)))
            }
            (TaskKind::Entity, DispatchTarget::Entity(entity)) => {
                Ok(Box::new(EntityTask::new(entity, operation)))
            }
            (kind, target) => Err(PersistError::IncompatibleTarget(format!(
                "cached verdict {:?} does not fit {}",
                kind,
                target.shape_name()
            ))),
        }
    }
}

impl Default for TaskDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
