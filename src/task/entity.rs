// ============================================================================
// Entity Task
// ============================================================================

use crate::connection::DatabaseConnection;
use crate::core::{EntityKey, PersistError, QuoteContext, Result};
use crate::entity::{EntityRef, Persistable};
use crate::task::{CommitEffect, DispatchTarget, Operation, Task, TaskKind};
use async_trait::async_trait;
use log::debug;

/// Generic fallback for a single entity: INSERT for keyless targets,
/// UPDATE for changed persisted targets, DELETE for orphans and explicit
/// deletes.
pub struct EntityTask {
    entity: EntityRef,
    operation: Operation,
    quoting: QuoteContext,
    generated_key: Option<EntityKey>,
    effect: Option<CommitEffect>,
}

impl EntityTask {
    pub fn new(entity: EntityRef, operation: Operation) -> Self {
        Self {
            entity,
            operation,
            quoting: QuoteContext::new(),
            generated_key: None,
            effect: None,
        }
    }

    pub fn is_compatible(
        target: &DispatchTarget,
        _operation: Operation,
    ) -> std::result::Result<(), String> {
        match target {
            DispatchTarget::Entity(_) => Ok(()),
            other => Err(format!("{} is not a single entity", other.shape_name())),
        }
    }

    async fn execute_persist(&mut self, conn: &mut dyn DatabaseConnection) -> Result<()> {
        let (orphan, key, changed) = {
            let guard = self.entity.read()?;
            (guard.is_orphan(), guard.key(), guard.is_changed())
        };

        // An orphan exists only to link rows that are no longer both
        // present; it gets a DELETE where an update would otherwise run.
        if orphan {
            if let Some(key) = key {
                let statement = {
                    let guard = self.entity.read()?;
                    delete_statement(&*guard, &key, &self.quoting)?
                };
                conn.execute(&statement).await?;
            }
            self.effect = Some(CommitEffect::EntityDeleted(self.entity.clone()));
            return Ok(());
        }

        match key {
            None => {
                let key = EntityKey::generate();
                let statement = {
                    let mut guard = self.entity.write()?;
                    guard.set_key(Some(key.clone()));
                    insert_statement(&*guard, &key, &self.quoting)?
                };
                self.generated_key = Some(key);
                conn.execute(&statement).await?;
            }
            Some(key) => {
                if changed {
                    let statement = {
                        let guard = self.entity.read()?;
                        update_statement(&*guard, &key, &self.quoting)?
                    };
                    conn.execute(&statement).await?;
                } else {
                    debug!("skipping unchanged entity with key '{}'", key);
                }
            }
        }

        self.effect = Some(CommitEffect::EntityPersisted(self.entity.clone()));
        Ok(())
    }

    async fn execute_delete(&mut self, conn: &mut dyn DatabaseConnection) -> Result<()> {
        let key = self.entity.read()?.key();
        if let Some(key) = key {
            let statement = {
                let guard = self.entity.read()?;
                delete_statement(&*guard, &key, &self.quoting)?
            };
            conn.execute(&statement).await?;
        }
        self.effect = Some(CommitEffect::EntityDeleted(self.entity.clone()));
        Ok(())
    }
}

#[async_trait]
impl Task for EntityTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Entity
    }

    fn operation(&self) -> Operation {
        self.operation
    }

    fn target(&self) -> DispatchTarget {
        DispatchTarget::Entity(self.entity.clone())
    }

    async fn execute(&mut self, conn: &mut dyn DatabaseConnection) -> Result<()> {
        match self.operation {
            Operation::Persist => self.execute_persist(conn).await,
            Operation::Delete => self.execute_delete(conn).await,
        }
    }

    fn revert(&mut self) {
        if self.generated_key.take().is_some() {
            if let Ok(mut guard) = self.entity.write() {
                guard.set_key(None);
            }
        }
        self.effect = None;
    }

    fn committed_effects(&self) -> Vec<CommitEffect> {
        self.effect.iter().cloned().collect()
    }

    fn describe(&self) -> String {
        let entity_type = self
            .entity
            .read()
            .map(|guard| guard.entity_type())
            .unwrap_or("<poisoned>");
        format!("{} {}", self.operation, entity_type)
    }
}

// ---------------------------------------------------------------------------
// Statement builders shared with the bulk task.
// ---------------------------------------------------------------------------

pub(crate) fn key_literals(key: &EntityKey, quoting: &QuoteContext) -> Result<Vec<String>> {
    let parts: Vec<&EntityKey> = match key {
        EntityKey::Composite(parts) => parts.iter().collect(),
        single => vec![single],
    };
    parts
        .iter()
        .map(|part| Ok(part.as_value()?.to_sql_literal(quoting)))
        .collect()
}

pub(crate) fn insert_columns(entity: &dyn Persistable, quoting: &QuoteContext) -> Vec<String> {
    let mut columns: Vec<String> = entity
        .key_columns()
        .iter()
        .map(|column| quoting.quote_identifier(column))
        .collect();
    for (name, _) in entity.field_values() {
        columns.push(quoting.quote_identifier(&name));
    }
    columns
}

pub(crate) fn insert_values(
    entity: &dyn Persistable,
    key: &EntityKey,
    quoting: &QuoteContext,
) -> Result<Vec<String>> {
    let key_columns = entity.key_columns();
    let mut values = key_literals(key, quoting)?;
    if values.len() != key_columns.len() {
        return Err(PersistError::Execution(format!(
            "key has {} component(s) but entity '{}' declares {} key column(s)",
            values.len(),
            entity.entity_type(),
            key_columns.len()
        )));
    }
    for (_, value) in entity.field_values() {
        values.push(value.to_sql_literal(quoting)?);
    }
    Ok(values)
}

pub(crate) fn insert_statement(
    entity: &dyn Persistable,
    key: &EntityKey,
    quoting: &QuoteContext,
) -> Result<String> {
    let columns = insert_columns(entity, quoting);
    let values = insert_values(entity, key, quoting)?;
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quoting.quote_identifier(entity.table()),
        columns.join(", "),
        values.join(", ")
    ))
}

pub(crate) fn update_statement(
    entity: &dyn Persistable,
    key: &EntityKey,
    quoting: &QuoteContext,
) -> Result<String> {
    let mut assignments = Vec::new();
    for (name, value) in entity.field_values() {
        assignments.push(format!(
            "{} = {}",
            quoting.quote_identifier(&name),
            value.to_sql_literal(quoting)?
        ));
    }
    if assignments.is_empty() {
        return Err(PersistError::Execution(format!(
            "entity '{}' has no non-key fields to update",
            entity.entity_type()
        )));
    }
    let predicate = key.to_predicate(&entity.key_columns(), quoting)?;
    Ok(format!(
        "UPDATE {} SET {} WHERE {}",
        quoting.quote_identifier(entity.table()),
        assignments.join(", "),
        predicate
    ))
}

pub(crate) fn delete_statement(
    entity: &dyn Persistable,
    key: &EntityKey,
    quoting: &QuoteContext,
) -> Result<String> {
    let predicate = key.to_predicate(&entity.key_columns(), quoting)?;
    Ok(format!(
        "DELETE FROM {} WHERE {}",
        quoting.quote_identifier(entity.table()),
        predicate
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnection;
    use crate::core::Value;
    use crate::entity::FieldValue;
    use crate::testutil::{StubEntity, persisted_note};

    #[tokio::test]
    async fn test_persist_new_entity_inserts_and_assigns_key() {
        let mut conn = MemoryConnection::new();
        let entity = StubEntity::new("note", "notes")
            .with_field("title", FieldValue::Scalar(Value::Text("a".to_string())))
            .into_ref();

        let mut task = EntityTask::new(entity.clone(), Operation::Persist);
        task.execute(&mut conn).await.unwrap();

        assert!(entity.read().unwrap().key().is_some());
        let statement = &conn.committed_statements()[0];
        assert!(statement.starts_with("INSERT INTO \"notes\""));
        assert!(statement.contains("'a'"));
    }

    #[tokio::test]
    async fn test_persist_changed_entity_updates() {
        let mut conn = MemoryConnection::new();
        let entity = StubEntity::new("note", "notes")
            .with_key(EntityKey::Int(5))
            .with_field("title", FieldValue::Scalar(Value::Text("b".to_string())))
            .changed()
            .into_ref();

        let mut task = EntityTask::new(entity.clone(), Operation::Persist);
        task.execute(&mut conn).await.unwrap();

        let statement = &conn.committed_statements()[0];
        assert!(statement.starts_with("UPDATE \"notes\" SET"));
        assert!(statement.ends_with("WHERE \"id\" = 5"));
    }

    #[tokio::test]
    async fn test_persist_unchanged_entity_is_noop() {
        let mut conn = MemoryConnection::new();
        let entity = persisted_note("quiet", 5);

        let mut task = EntityTask::new(entity, Operation::Persist);
        task.execute(&mut conn).await.unwrap();
        assert!(conn.committed_statements().is_empty());
    }

    #[tokio::test]
    async fn test_persist_orphan_substitutes_delete() {
        let mut conn = MemoryConnection::new();
        let entity = StubEntity::new("link", "links")
            .with_key(EntityKey::Int(8))
            .changed()
            .orphaned()
            .into_ref();

        let mut task = EntityTask::new(entity, Operation::Persist);
        task.execute(&mut conn).await.unwrap();

        let statement = &conn.committed_statements()[0];
        assert_eq!(statement, "DELETE FROM \"links\" WHERE \"id\" = 8");
    }

    #[tokio::test]
    async fn test_revert_clears_generated_key() {
        let mut conn = MemoryConnection::new();
        let entity = StubEntity::new("note", "notes")
            .with_field("title", FieldValue::Scalar(Value::Text("c".to_string())))
            .into_ref();

        let mut task = EntityTask::new(entity.clone(), Operation::Persist);
        task.execute(&mut conn).await.unwrap();
        assert!(entity.read().unwrap().key().is_some());

        task.revert();
        assert!(entity.read().unwrap().key().is_none());
        assert!(task.committed_effects().is_empty());
    }

    #[tokio::test]
    async fn test_delete_without_key_is_noop_statement() {
        let mut conn = MemoryConnection::new();
        let entity = StubEntity::new("note", "notes").into_ref();

        let mut task = EntityTask::new(entity, Operation::Delete);
        task.execute(&mut conn).await.unwrap();
        assert!(conn.committed_statements().is_empty());
        assert_eq!(task.committed_effects().len(), 1);
    }
}
