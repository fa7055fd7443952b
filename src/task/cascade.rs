// ============================================================================
// Cascade Resolver
// ============================================================================

use crate::core::Result;
use crate::entity::{EntityRef, FieldValue};
use crate::task::{DispatchTarget, EntityTask, LobTask, Operation, Task};
use log::debug;
use std::sync::Arc;

/// Discover dependent sub-objects of a persist task and synthesize the
/// tasks that must run ahead of it: new or changed large objects get
/// uploaded, and not-yet-persisted related entities get persisted, before
/// the row referencing them is written.
///
/// Returned tasks are in dependency order (deepest first). Cyclic entity
/// graphs terminate via a visited set; the back-reference of a cycle is
/// written as NULL and wired on a later flush.
pub fn expand_dependencies(task: &dyn Task) -> Result<Vec<Box<dyn Task>>> {
    if task.operation() != Operation::Persist {
        return Ok(Vec::new());
    }

    let mut visited: Vec<EntityRef> = Vec::new();
    let mut dependencies: Vec<Box<dyn Task>> = Vec::new();

    match task.target() {
        DispatchTarget::Entity(entity) => {
            mark_visited(&mut visited, &entity);
            collect(&entity, &mut visited, &mut dependencies)?;
        }
        DispatchTarget::Collection(members) => {
            for member in &members {
                mark_visited(&mut visited, member);
            }
            for member in &members {
                collect(member, &mut visited, &mut dependencies)?;
            }
        }
        _ => {}
    }

    if !dependencies.is_empty() {
        debug!(
            "cascade expanded '{}' with {} dependency task(s)",
            task.describe(),
            dependencies.len()
        );
    }
    Ok(dependencies)
}

fn mark_visited(visited: &mut Vec<EntityRef>, entity: &EntityRef) -> bool {
    if visited.iter().any(|seen| Arc::ptr_eq(seen, entity)) {
        return false;
    }
    visited.push(entity.clone());
    true
}

fn collect(
    entity: &EntityRef,
    visited: &mut Vec<EntityRef>,
    out: &mut Vec<Box<dyn Task>>,
) -> Result<()> {
    let fields = entity.read()?.field_values();

    for (_, value) in fields {
        match value {
            FieldValue::Blob(lob) => {
                let pending = {
                    let guard = lob.read()?;
                    guard.is_new() || guard.is_changed()
                };
                if pending {
                    out.push(Box::new(LobTask::new(lob, Operation::Persist)));
                }
            }
            FieldValue::Related(other) => {
                let unpersisted = other.read()?.key().is_none();
                if unpersisted && mark_visited(visited, &other) {
                    collect(&other, visited, out)?;
                    out.push(Box::new(EntityTask::new(other, Operation::Persist)));
                }
            }
            FieldValue::Scalar(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use crate::entity::LargeObject;
    use crate::task::TaskKind;
    use crate::testutil::StubEntity;

    #[test]
    fn test_new_blob_field_cascades_upload() {
        let lob = LargeObject::new(b"attachment".to_vec()).into_ref();
        let entity = StubEntity::new("doc", "docs")
            .with_field("body", FieldValue::Blob(lob))
            .into_ref();

        let task = EntityTask::new(entity, Operation::Persist);
        let deps = expand_dependencies(&task).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].kind(), TaskKind::Lob);
    }

    #[test]
    fn test_uploaded_unchanged_blob_does_not_cascade() {
        let lob = LargeObject::new(b"attachment".to_vec()).into_ref();
        lob.write().unwrap().assign_handle(uuid::Uuid::new_v4());
        let entity = StubEntity::new("doc", "docs")
            .with_field("body", FieldValue::Blob(lob))
            .into_ref();

        let task = EntityTask::new(entity, Operation::Persist);
        assert!(expand_dependencies(&task).unwrap().is_empty());
    }

    #[test]
    fn test_new_related_entity_cascades_before_parent() {
        let author = StubEntity::new("author", "authors")
            .with_field("name", FieldValue::Scalar(Value::Text("b".to_string())))
            .into_ref();
        let doc = StubEntity::new("doc", "docs")
            .with_field("author", FieldValue::Related(author))
            .into_ref();

        let task = EntityTask::new(doc, Operation::Persist);
        let deps = expand_dependencies(&task).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].kind(), TaskKind::Entity);
        assert_eq!(deps[0].operation(), Operation::Persist);
    }

    #[test]
    fn test_chain_is_ordered_deepest_first() {
        let grandparent = StubEntity::new("org", "orgs").into_ref();
        let parent = StubEntity::new("team", "teams")
            .with_field("org", FieldValue::Related(grandparent.clone()))
            .into_ref();
        let child = StubEntity::new("member", "members")
            .with_field("team", FieldValue::Related(parent.clone()))
            .into_ref();

        let task = EntityTask::new(child, Operation::Persist);
        let deps = expand_dependencies(&task).unwrap();
        assert_eq!(deps.len(), 2);
        // Grandparent first, then parent; both before the enqueuing child.
        assert!(deps[0].target().matches(&DispatchTarget::Entity(grandparent)));
        assert!(deps[1].target().matches(&DispatchTarget::Entity(parent)));
    }

    #[test]
    fn test_shared_dependency_is_synthesized_once() {
        let shared = StubEntity::new("author", "authors").into_ref();
        let doc = StubEntity::new("doc", "docs")
            .with_field("created_by", FieldValue::Related(shared.clone()))
            .with_field("updated_by", FieldValue::Related(shared.clone()))
            .into_ref();

        let task = EntityTask::new(doc, Operation::Persist);
        let deps = expand_dependencies(&task).unwrap();
        assert_eq!(deps.len(), 1);
    }

    #[test]
    fn test_delete_does_not_cascade() {
        let lob = LargeObject::new(b"attachment".to_vec()).into_ref();
        let entity = StubEntity::new("doc", "docs")
            .with_field("body", FieldValue::Blob(lob))
            .into_ref();

        let task = EntityTask::new(entity, Operation::Delete);
        assert!(expand_dependencies(&task).unwrap().is_empty());
    }
}
