// ============================================================================
// Large Object Task
// ============================================================================

use crate::connection::DatabaseConnection;
use crate::core::{QuoteContext, Result};
use crate::entity::LobRef;
use crate::task::{CommitEffect, DispatchTarget, Operation, Task, TaskKind};
use async_trait::async_trait;
use log::debug;
use uuid::Uuid;

/// Table holding uploaded binary content, keyed by storage handle.
pub const LOB_STORAGE_TABLE: &str = "large_objects";

/// Most specific task variant: accepts only the large-binary-object value
/// type. Persist uploads the bytes and records the resulting storage handle
/// on the object; delete releases the handle.
pub struct LobTask {
    lob: LobRef,
    operation: Operation,
    quoting: QuoteContext,
    uploaded: bool,
    effect: Option<CommitEffect>,
}

impl LobTask {
    pub fn new(lob: LobRef, operation: Operation) -> Self {
        Self {
            lob,
            operation,
            quoting: QuoteContext::new(),
            uploaded: false,
            effect: None,
        }
    }

    pub fn is_compatible(
        target: &DispatchTarget,
        _operation: Operation,
    ) -> std::result::Result<(), String> {
        match target {
            DispatchTarget::Lob(_) => Ok(()),
            other => Err(format!("{} is not a large object value", other.shape_name())),
        }
    }

    async fn execute_persist(&mut self, conn: &mut dyn DatabaseConnection) -> Result<()> {
        let (is_new, is_changed) = {
            let guard = self.lob.read()?;
            (guard.is_new(), guard.is_changed())
        };

        if is_new {
            let handle = Uuid::new_v4();
            let statement = {
                let mut guard = self.lob.write()?;
                guard.assign_handle(handle);
                format!(
                    "INSERT INTO {} ({}, {}, {}, {}) VALUES ({}, {}, {}, {})",
                    self.quoting.quote_identifier(LOB_STORAGE_TABLE),
                    self.quoting.quote_identifier("handle"),
                    self.quoting.quote_identifier("content"),
                    self.quoting.quote_identifier("checksum"),
                    self.quoting.quote_identifier("created_at"),
                    self.quoting.quote_text(&handle.to_string()),
                    self.quoting.quote_text(&content_hex(guard.content())),
                    self.quoting.quote_text(&guard.checksum()),
                    self.quoting.quote_text(&guard.created_at().to_rfc3339()),
                )
            };
            self.uploaded = true;
            debug!("uploading large object as handle '{}'", handle);
            conn.execute(&statement).await?;
        } else if is_changed {
            let statement = {
                let guard = self.lob.read()?;
                let Some(handle) = guard.handle() else {
                    return Err(crate::core::PersistError::Lob(
                        "changed large object has no storage handle".to_string(),
                    ));
                };
                format!(
                    "UPDATE {} SET {} = {}, {} = {} WHERE {} = {}",
                    self.quoting.quote_identifier(LOB_STORAGE_TABLE),
                    self.quoting.quote_identifier("content"),
                    self.quoting.quote_text(&content_hex(guard.content())),
                    self.quoting.quote_identifier("checksum"),
                    self.quoting.quote_text(&guard.checksum()),
                    self.quoting.quote_identifier("handle"),
                    self.quoting.quote_text(&handle.to_string()),
                )
            };
            conn.execute(&statement).await?;
        } else {
            debug!("skipping unchanged large object");
        }

        self.effect = Some(CommitEffect::LobPersisted(self.lob.clone()));
        Ok(())
    }

    async fn execute_delete(&mut self, conn: &mut dyn DatabaseConnection) -> Result<()> {
        let handle = self.lob.read()?.handle();
        if let Some(handle) = handle {
            let statement = format!(
                "DELETE FROM {} WHERE {} = {}",
                self.quoting.quote_identifier(LOB_STORAGE_TABLE),
                self.quoting.quote_identifier("handle"),
                self.quoting.quote_text(&handle.to_string()),
            );
            conn.execute(&statement).await?;
        }
        self.effect = Some(CommitEffect::LobDeleted(self.lob.clone()));
        Ok(())
    }
}

#[async_trait]
impl Task for LobTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Lob
    }

    fn operation(&self) -> Operation {
        self.operation
    }

    fn target(&self) -> DispatchTarget {
        DispatchTarget::Lob(self.lob.clone())
    }

    async fn execute(&mut self, conn: &mut dyn DatabaseConnection) -> Result<()> {
        match self.operation {
            Operation::Persist => self.execute_persist(conn).await,
            Operation::Delete => self.execute_delete(conn).await,
        }
    }

    fn revert(&mut self) {
        if self.uploaded {
            if let Ok(mut guard) = self.lob.write() {
                guard.clear_handle();
            }
            self.uploaded = false;
        }
        self.effect = None;
    }

    fn committed_effects(&self) -> Vec<CommitEffect> {
        self.effect.iter().cloned().collect()
    }

    fn describe(&self) -> String {
        format!("{} large object", self.operation)
    }
}

fn content_hex(content: &[u8]) -> String {
    let mut hex = String::with_capacity(content.len() * 2);
    for byte in content {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}
