// ============================================================================
// Bulk Collection Task
// ============================================================================

use crate::connection::DatabaseConnection;
use crate::core::{EntityKey, PersistError, QuoteContext, Result};
use crate::entity::EntityRef;
use crate::task::entity::{delete_statement, insert_columns, insert_values, update_statement};
use crate::task::{CommitEffect, DispatchTarget, Operation, Task, TaskKind};
use async_trait::async_trait;
use log::debug;

/// Batched DML over a homogeneous ordered collection: one multi-row INSERT
/// for the new members, one key-batched DELETE where keys allow it, and
/// per-row UPDATEs for the rest.
pub struct BulkTask {
    entities: Vec<EntityRef>,
    operation: Operation,
    quoting: QuoteContext,
    keyed_members: Vec<EntityRef>,
    effects: Vec<CommitEffect>,
}

impl BulkTask {
    pub fn new(entities: Vec<EntityRef>, operation: Operation) -> Result<Self> {
        Self::check_members(&entities).map_err(PersistError::IncompatibleTarget)?;
        Ok(Self {
            entities,
            operation,
            quoting: QuoteContext::new(),
            keyed_members: Vec::new(),
            effects: Vec::new(),
        })
    }

    pub fn is_compatible(
        target: &DispatchTarget,
        _operation: Operation,
    ) -> std::result::Result<(), String> {
        match target {
            DispatchTarget::Collection(members) => Self::check_members(members),
            other => Err(format!("{} is not a collection", other.shape_name())),
        }
    }

    fn check_members(members: &[EntityRef]) -> std::result::Result<(), String> {
        let Some(first) = members.first() else {
            return Err("collection is empty".to_string());
        };
        let first_type = first
            .read()
            .map(|guard| guard.entity_type())
            .map_err(|err| err.to_string())?;
        for member in &members[1..] {
            let member_type = member
                .read()
                .map(|guard| guard.entity_type())
                .map_err(|err| err.to_string())?;
            if member_type != first_type {
                return Err(format!(
                    "collection mixes entity types '{}' and '{}'",
                    first_type, member_type
                ));
            }
        }
        Ok(())
    }

    fn plan_persist(&mut self) -> Result<Vec<String>> {
        let mut statements = Vec::new();
        let mut insert_groups: Vec<String> = Vec::new();
        let mut insert_cols: Option<(String, Vec<String>)> = None;
        let mut delete_keys: Vec<(EntityRef, EntityKey)> = Vec::new();

        for member in &self.entities {
            let (orphan, key, changed) = {
                let guard = member.read()?;
                (guard.is_orphan(), guard.key(), guard.is_changed())
            };

            if orphan {
                if let Some(key) = key {
                    delete_keys.push((member.clone(), key));
                }
                self.effects.push(CommitEffect::EntityDeleted(member.clone()));
                continue;
            }

            match key {
                None => {
                    let key = EntityKey::generate();
                    let mut guard = member.write()?;
                    guard.set_key(Some(key.clone()));
                    if insert_cols.is_none() {
                        insert_cols = Some((
                            guard.table().to_string(),
                            insert_columns(&*guard, &self.quoting),
                        ));
                    }
                    let values = insert_values(&*guard, &key, &self.quoting)?;
                    insert_groups.push(format!("({})", values.join(", ")));
                    drop(guard);
                    self.keyed_members.push(member.clone());
                }
                Some(key) => {
                    if changed {
                        let guard = member.read()?;
                        statements.push(update_statement(&*guard, &key, &self.quoting)?);
                    }
                }
            }
            self.effects.push(CommitEffect::EntityPersisted(member.clone()));
        }

        if let Some((table, columns)) = insert_cols {
            statements.insert(
                0,
                format!(
                    "INSERT INTO {} ({}) VALUES {}",
                    self.quoting.quote_identifier(&table),
                    columns.join(", "),
                    insert_groups.join(", ")
                ),
            );
        }

        statements.extend(self.plan_deletes(&delete_keys)?);
        Ok(statements)
    }

    fn plan_delete(&mut self) -> Result<Vec<String>> {
        let mut delete_keys: Vec<(EntityRef, EntityKey)> = Vec::new();
        for member in &self.entities {
            if let Some(key) = member.read()?.key() {
                delete_keys.push((member.clone(), key));
            }
            self.effects.push(CommitEffect::EntityDeleted(member.clone()));
        }
        self.plan_deletes(&delete_keys)
    }

    /// One `WHERE key IN (...)` statement for plain single-column keys,
    /// per-row deletes otherwise.
    fn plan_deletes(&self, delete_keys: &[(EntityRef, EntityKey)]) -> Result<Vec<String>> {
        let Some((first, _)) = delete_keys.first() else {
            return Ok(Vec::new());
        };

        let (table, key_columns) = {
            let guard = first.read()?;
            (guard.table().to_string(), guard.key_columns())
        };

        let batchable = key_columns.len() == 1
            && delete_keys
                .iter()
                .all(|(_, key)| !matches!(key, EntityKey::Composite(_)));

        if batchable {
            let literals: Vec<String> = delete_keys
                .iter()
                .map(|(_, key)| Ok(key.as_value()?.to_sql_literal(&self.quoting)))
                .collect::<Result<_>>()?;
            return Ok(vec![format!(
                "DELETE FROM {} WHERE {} IN ({})",
                self.quoting.quote_identifier(&table),
                self.quoting.quote_identifier(&key_columns[0]),
                literals.join(", ")
            )]);
        }

        delete_keys
            .iter()
            .map(|(member, key)| {
                let guard = member.read()?;
                delete_statement(&*guard, key, &self.quoting)
            })
            .collect()
    }
}

#[async_trait]
impl Task for BulkTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Bulk
    }

    fn operation(&self) -> Operation {
        self.operation
    }

    fn target(&self) -> DispatchTarget {
        DispatchTarget::Collection(self.entities.clone())
    }

    async fn execute(&mut self, conn: &mut dyn DatabaseConnection) -> Result<()> {
        self.effects.clear();
        let statements = match self.operation {
            Operation::Persist => self.plan_persist()?,
            Operation::Delete => self.plan_delete()?,
        };
        debug!(
            "bulk {} over {} member(s): {} statement(s)",
            self.operation,
            self.entities.len(),
            statements.len()
        );
        for statement in statements {
            conn.execute(&statement).await?;
        }
        Ok(())
    }

    fn revert(&mut self) {
        for member in self.keyed_members.drain(..) {
            if let Ok(mut guard) = member.write() {
                guard.set_key(None);
            }
        }
        self.effects.clear();
    }

    fn committed_effects(&self) -> Vec<CommitEffect> {
        self.effects.clone()
    }

    fn describe(&self) -> String {
        format!("bulk {} of {} member(s)", self.operation, self.entities.len())
    }
}
