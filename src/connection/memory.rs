// ============================================================================
// In-Memory Connection
// ============================================================================

use crate::connection::DatabaseConnection;
use crate::core::{PersistError, Result};
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;

/// In-memory backend used by tests, doctests, and embedded callers.
///
/// Statements are buffered while a transaction is open and applied to the
/// committed journal on commit; rollback discards them. Recognized shapes:
/// `INSERT INTO ...`, `UPDATE ...`, `DELETE FROM ...`, and `SET <var> =
/// <value>` scratch variables. Anything else fails the way a backend
/// rejects a malformed statement.
pub struct MemoryConnection {
    committed: Vec<String>,
    vars: HashMap<String, String>,
    pending_statements: Vec<String>,
    pending_vars: Vec<(String, String)>,
    in_transaction: bool,
    fail_markers: Vec<String>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self {
            committed: Vec::new(),
            vars: HashMap::new(),
            pending_statements: Vec::new(),
            pending_vars: Vec::new(),
            in_transaction: false,
            fail_markers: Vec::new(),
        }
    }

    /// Every statement containing `marker` will fail with an execution
    /// error. Used to simulate backend failures in tests.
    pub fn fail_on(&mut self, marker: impl Into<String>) {
        self.fail_markers.push(marker.into());
    }

    /// Statements applied by committed transactions, in commit order.
    pub fn committed_statements(&self) -> &[String] {
        &self.committed
    }

    /// Committed value of a scratch variable.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Count of committed statements touching `table`.
    pub fn statements_for_table(&self, table: &str) -> usize {
        self.committed
            .iter()
            .filter(|stmt| stmt.contains(table))
            .count()
    }

    fn check_markers(&self, statement: &str) -> Result<()> {
        for marker in &self.fail_markers {
            if statement.contains(marker.as_str()) {
                return Err(PersistError::Execution(format!(
                    "forced failure on statement: {}",
                    statement
                )));
            }
        }
        Ok(())
    }

    fn parse(&self, statement: &str) -> Result<ParsedStatement> {
        let trimmed = statement.trim();
        let upper = trimmed.to_ascii_uppercase();

        if upper.starts_with("INSERT INTO ")
            || upper.starts_with("UPDATE ")
            || upper.starts_with("DELETE FROM ")
        {
            let affected = if upper.starts_with("INSERT INTO ") {
                // One row per VALUES group.
                trimmed.matches("), (").count() as u64 + 1
            } else {
                1
            };
            return Ok(ParsedStatement::Dml {
                text: trimmed.to_string(),
                affected,
            });
        }

        if let Some(rest) = strip_keyword(trimmed, "SET ") {
            let mut split = rest.splitn(2, '=');
            let name = split.next().unwrap_or_default().trim();
            let value = split.next().map(str::trim);
            if let (false, Some(value)) = (name.is_empty(), value) {
                return Ok(ParsedStatement::SetVar {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
        }

        Err(PersistError::Execution(format!(
            "syntax error near '{}'",
            trimmed.split_whitespace().next().unwrap_or(trimmed)
        )))
    }

    fn apply(&mut self, parsed: ParsedStatement) -> u64 {
        match parsed {
            ParsedStatement::Dml { text, affected } => {
                if self.in_transaction {
                    self.pending_statements.push(text);
                } else {
                    self.committed.push(text);
                }
                affected
            }
            ParsedStatement::SetVar { name, value } => {
                if self.in_transaction {
                    self.pending_vars.push((name, value));
                } else {
                    self.vars.insert(name, value);
                }
                1
            }
        }
    }
}

enum ParsedStatement {
    Dml { text: String, affected: u64 },
    SetVar { name: String, value: String },
}

fn strip_keyword<'a>(statement: &'a str, keyword: &str) -> Option<&'a str> {
    let head = statement.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword) {
        Some(&statement[keyword.len()..])
    } else {
        None
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseConnection for MemoryConnection {
    async fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(PersistError::Execution(
                "Transaction already active".to_string(),
            ));
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(PersistError::Execution("No active transaction".to_string()));
        }
        debug!(
            "committing {} statement(s), {} var assignment(s)",
            self.pending_statements.len(),
            self.pending_vars.len()
        );
        self.committed.append(&mut self.pending_statements);
        for (name, value) in self.pending_vars.drain(..) {
            self.vars.insert(name, value);
        }
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(PersistError::Execution("No active transaction".to_string()));
        }
        debug!(
            "rolling back {} pending statement(s)",
            self.pending_statements.len()
        );
        self.pending_statements.clear();
        self.pending_vars.clear();
        self.in_transaction = false;
        Ok(())
    }

    async fn execute(&mut self, statement: &str) -> Result<u64> {
        self.check_markers(statement)?;
        let parsed = self.parse(statement)?;
        Ok(self.apply(parsed))
    }

    fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }
}
