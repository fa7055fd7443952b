// ============================================================================
// Raw Statement Task
// ============================================================================

use crate::connection::DatabaseConnection;
use crate::core::{PersistError, QuoteContext, Result, Value};
use crate::task::{CommitEffect, DispatchTarget, Operation, Task, TaskKind};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

/// Anything that can render itself to executable statement text.
pub trait RenderStatement: Send + Sync {
    fn render(&self, quoting: &QuoteContext) -> Result<String>;
}

/// Verbatim statement text with positional `?` placeholders substituted as
/// quoted literals at render time.
pub struct RawStatement {
    text: String,
    params: Vec<Value>,
}

impl RawStatement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(text: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            text: text.into(),
            params,
        }
    }

    pub fn into_target(self) -> DispatchTarget {
        DispatchTarget::Statement(Arc::new(self))
    }
}

impl RenderStatement for RawStatement {
    fn render(&self, quoting: &QuoteContext) -> Result<String> {
        let placeholder_count = self.text.matches('?').count();
        if placeholder_count != self.params.len() {
            return Err(PersistError::Execution(format!(
                "statement has {} placeholder(s) but {} parameter(s) were bound",
                placeholder_count,
                self.params.len()
            )));
        }

        let mut rendered = String::with_capacity(self.text.len());
        let mut params = self.params.iter();
        for ch in self.text.chars() {
            if ch == '?' {
                let param = params.next().expect("placeholder count was checked");
                rendered.push_str(&param.to_sql_literal(quoting));
            } else {
                rendered.push(ch);
            }
        }
        Ok(rendered)
    }
}

/// Executes a statement-renderable object verbatim. Malformed statements
/// propagate as backend errors.
pub struct StatementTask {
    statement: Arc<dyn RenderStatement>,
    operation: Operation,
    quoting: QuoteContext,
}

impl StatementTask {
    pub fn new(statement: Arc<dyn RenderStatement>, operation: Operation) -> Self {
        Self {
            statement,
            operation,
            quoting: QuoteContext::new(),
        }
    }

    /// Any statement-renderable object is acceptable, for either operation.
    pub fn is_compatible(
        target: &DispatchTarget,
        _operation: Operation,
    ) -> std::result::Result<(), String> {
        match target {
            DispatchTarget::Statement(_) => Ok(()),
            other => Err(format!("{} is not statement-renderable", other.shape_name())),
        }
    }
}

#[async_trait]
impl Task for StatementTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Statement
    }

    fn operation(&self) -> Operation {
        self.operation
    }

    fn target(&self) -> DispatchTarget {
        DispatchTarget::Statement(Arc::clone(&self.statement))
    }

    async fn execute(&mut self, conn: &mut dyn DatabaseConnection) -> Result<()> {
        let rendered = self.statement.render(&self.quoting)?;
        debug!("executing raw statement: {}", rendered);
        conn.execute(&rendered).await?;
        Ok(())
    }

    fn revert(&mut self) {
        // A raw statement mutates no in-memory target.
    }

    fn committed_effects(&self) -> Vec<CommitEffect> {
        Vec::new()
    }

    fn describe(&self) -> String {
        "raw statement".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_params() {
        let quoting = QuoteContext::new();
        let statement = RawStatement::with_params(
            "UPDATE notes SET title = ? WHERE id = ?",
            vec![Value::Text("O'Brien".to_string()), Value::Integer(3)],
        );
        assert_eq!(
            statement.render(&quoting).unwrap(),
            "UPDATE notes SET title = 'O''Brien' WHERE id = 3"
        );
    }

    #[test]
    fn test_render_rejects_arity_mismatch() {
        let quoting = QuoteContext::new();
        let statement = RawStatement::with_params("SET t = ?", Vec::new());
        assert!(statement.render(&quoting).is_err());
    }

    #[tokio::test]
    async fn test_execute_propagates_backend_error() {
        use crate::connection::MemoryConnection;

        let mut conn = MemoryConnection::new();
        let mut task = StatementTask::new(
            Arc::new(RawStatement::new("DEFINITELY NOT SQL")),
            Operation::Persist,
        );
        assert!(task.execute(&mut conn).await.is_err());
    }
}
