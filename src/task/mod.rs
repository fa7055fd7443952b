// ============================================================================
// Work Item ("Task") Layer
// ============================================================================
//
// One task wraps one target object plus the action to take against it.
// Variants declare compatibility through a static predicate; the dispatcher
// walks the variants most-specific-first. Execution happens inside a flush,
// against the connection the coordinator holds open.
// ============================================================================

pub mod bulk;
pub mod cascade;
pub mod dispatch;
pub mod entity;
pub mod lob;
pub mod statement;

use crate::connection::DatabaseConnection;
use crate::core::Result;
use crate::entity::{EntityRef, LobRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use bulk::BulkTask;
pub use cascade::expand_dependencies;
pub use dispatch::TaskDispatcher;
pub use entity::EntityTask;
pub use lob::LobTask;
pub use statement::{RawStatement, RenderStatement, StatementTask};

/// What the caller wants done with a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Persist,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Persist => write!(f, "persist"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Task variant, in dispatch priority order (most specific first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Lob,
    Bulk,
    Statement,
    Entity,
}

/// An object handed to the dispatcher.
#[derive(Clone)]
pub enum DispatchTarget {
    Lob(LobRef),
    Collection(Vec<EntityRef>),
    Statement(Arc<dyn RenderStatement>),
    Entity(EntityRef),
}

impl DispatchTarget {
    pub fn shape_name(&self) -> &'static str {
        match self {
            DispatchTarget::Lob(_) => "large object",
            DispatchTarget::Collection(_) => "collection",
            DispatchTarget::Statement(_) => "statement",
            DispatchTarget::Entity(_) => "entity",
        }
    }

    /// Instance identity between a filter target and a task target.
    ///
    /// A single entity or large object also matches a collection that
    /// contains it.
    pub fn matches(&self, other: &DispatchTarget) -> bool {
        match (self, other) {
            (DispatchTarget::Entity(a), DispatchTarget::Entity(b)) => Arc::ptr_eq(a, b),
            (DispatchTarget::Entity(a), DispatchTarget::Collection(members)) => {
                members.iter().any(|member| Arc::ptr_eq(a, member))
            }
            (DispatchTarget::Lob(a), DispatchTarget::Lob(b)) => Arc::ptr_eq(a, b),
            (DispatchTarget::Statement(a), DispatchTarget::Statement(b)) => Arc::ptr_eq(a, b),
            (DispatchTarget::Collection(a), DispatchTarget::Collection(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(left, right)| Arc::ptr_eq(left, right))
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for DispatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchTarget::Collection(members) => {
                write!(f, "Collection(len={})", members.len())
            }
            other => write!(f, "{}", other.shape_name()),
        }
    }
}

/// Effect a committed task had on its target, applied to the identity map
/// by the coordinator after the enclosing database transaction commits.
#[derive(Clone)]
pub enum CommitEffect {
    EntityPersisted(EntityRef),
    EntityDeleted(EntityRef),
    LobPersisted(LobRef),
    LobDeleted(LobRef),
}

/// One unit of pending persistence work.
///
/// `execute` must not raise for expected non-effects (an unchanged entity,
/// a delete of a never-persisted row) but propagates backend errors
/// verbatim. Target mutations made during `execute` (generated keys,
/// uploaded handles) are captured so `revert` can restore the target when
/// the enclosing transaction rolls back.
#[async_trait]
pub trait Task: Send + Sync {
    fn kind(&self) -> TaskKind;

    fn operation(&self) -> Operation;

    fn target(&self) -> DispatchTarget;

    async fn execute(&mut self, conn: &mut dyn DatabaseConnection) -> Result<()>;

    /// Undo target mutations made by `execute`.
    fn revert(&mut self);

    /// Identity-map effects to apply once the transaction has committed.
    fn committed_effects(&self) -> Vec<CommitEffect>;

    fn describe(&self) -> String;
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("describe", &self.describe())
            .finish()
    }
}
