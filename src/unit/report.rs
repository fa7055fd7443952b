// ============================================================================
// Flush Report
// ============================================================================

use crate::core::PersistError;
use crate::task::{DispatchTarget, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Outcome of one task inside a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushStatus {
    Success,
    Failed,
    RolledBack,
}

impl std::fmt::Display for FlushStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushStatus::Success => write!(f, "SUCCESS"),
            FlushStatus::Failed => write!(f, "FAILED"),
            FlushStatus::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

pub struct ReportEntry {
    task: Arc<dyn Task>,
    status: FlushStatus,
}

impl std::fmt::Debug for ReportEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportEntry")
            .field("task", &self.task.describe())
            .field("status", &self.status)
            .finish()
    }
}

impl ReportEntry {
    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    pub fn status(&self) -> FlushStatus {
        self.status
    }
}

/// Structured, queryable outcome of one flush call.
///
/// Append-only while the flush runs: per-transaction ordered task outcomes
/// plus captured execution errors, keyed by transaction and flattened in
/// chronological order.
pub struct FlushReport {
    transactions: Vec<(String, Vec<ReportEntry>)>,
    errors: Vec<(String, PersistError)>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for FlushReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushReport")
            .field("transactions", &self.transactions)
            .field("errors", &self.errors)
            .field("started_at", &self.started_at)
            .field("finished_at", &self.finished_at)
            .finish()
    }
}

impl FlushReport {
    pub fn new() -> Self {
        Self {
            transactions: Vec::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn add(&mut self, transaction: &str, task: Arc<dyn Task>, status: FlushStatus) {
        let entry = ReportEntry { task, status };
        if let Some((_, entries)) = self
            .transactions
            .iter_mut()
            .find(|(name, _)| name.as_str() == transaction)
        {
            entries.push(entry);
        } else {
            self.transactions.push((transaction.to_string(), vec![entry]));
        }
    }

    pub(crate) fn add_error(&mut self, transaction: &str, error: PersistError) {
        self.errors.push((transaction.to_string(), error));
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Transaction names in flush order.
    pub fn transaction_names(&self) -> Vec<&str> {
        self.transactions
            .iter()
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Ordered entries for one transaction.
    pub fn entries(&self, transaction: &str) -> Option<&[ReportEntry]> {
        self.transactions
            .iter()
            .find(|(name, _)| name.as_str() == transaction)
            .map(|(_, entries)| entries.as_slice())
    }

    /// Total recorded entries.
    pub fn len(&self) -> usize {
        self.transactions
            .iter()
            .map(|(_, entries)| entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn scoped_entries<'a>(
        &'a self,
        transaction: Option<&'a str>,
    ) -> impl Iterator<Item = &'a ReportEntry> {
        self.transactions
            .iter()
            .filter(move |(name, _)| transaction.is_none_or(|wanted| name.as_str() == wanted))
            .flat_map(|(_, entries)| entries.iter())
    }

    /// Did every recorded task succeed? Without a transaction name the
    /// aggregate is checked: any failure or rollback anywhere makes it
    /// false.
    pub fn is_success(&self, transaction: Option<&str>) -> bool {
        let scope_errors = self
            .errors
            .iter()
            .any(|(name, _)| transaction.is_none_or(|wanted| name.as_str() == wanted));
        !scope_errors
            && self
                .scoped_entries(transaction)
                .all(|entry| entry.status == FlushStatus::Success)
    }

    /// Was anything rolled back? Without a transaction name, any rollback
    /// anywhere counts.
    pub fn is_rolled_back(&self, transaction: Option<&str>) -> bool {
        self.scoped_entries(transaction)
            .any(|entry| entry.status == FlushStatus::RolledBack)
    }

    /// True iff at least one task anywhere recorded SUCCESS.
    pub fn done_anything(&self) -> bool {
        self.scoped_entries(None)
            .any(|entry| entry.status == FlushStatus::Success)
    }

    /// Captured execution errors, flattened chronologically or scoped to
    /// one transaction.
    pub fn errors(&self, transaction: Option<&str>) -> Vec<&PersistError> {
        self.errors
            .iter()
            .filter(|(name, _)| transaction.is_none_or(|wanted| name.as_str() == wanted))
            .map(|(_, error)| error)
            .collect()
    }

    pub fn first_error(&self) -> Option<&PersistError> {
        self.errors.first().map(|(_, error)| error)
    }

    /// Sub-report with only the entries whose task target matches the
    /// given one (a single entity also matches collections containing it).
    pub fn filter_by_target(&self, filter: &DispatchTarget) -> FlushReport {
        self.filtered(|entry| filter.matches(&entry.task.target()))
    }

    /// Sub-report with only the entries recording this exact task instance.
    pub fn filter_by_task(&self, task: &Arc<dyn Task>) -> FlushReport {
        self.filtered(|entry| Arc::ptr_eq(&entry.task, task))
    }

    fn filtered(&self, keep: impl Fn(&ReportEntry) -> bool) -> FlushReport {
        let mut sub = FlushReport::new();
        sub.started_at = self.started_at;
        sub.finished_at = self.finished_at;

        for (name, entries) in &self.transactions {
            for entry in entries {
                if keep(entry) {
                    sub.add(name, Arc::clone(&entry.task), entry.status);
                }
            }
        }
        for (name, error) in &self.errors {
            if sub.entries(name).is_some() {
                sub.add_error(name, error.clone());
            }
        }
        sub
    }

    /// Per-transaction status counts, for logs and diagnostics.
    pub fn summary(&self) -> serde_json::Value {
        let transactions: Vec<serde_json::Value> = self
            .transactions
            .iter()
            .map(|(name, entries)| {
                let count = |wanted: FlushStatus| {
                    entries.iter().filter(|entry| entry.status == wanted).count()
                };
                json!({
                    "transaction": name,
                    "success": count(FlushStatus::Success),
                    "failed": count(FlushStatus::Failed),
                    "rolled_back": count(FlushStatus::RolledBack),
                })
            })
            .collect();

        json!({
            "started_at": self.started_at.to_rfc3339(),
            "finished_at": self.finished_at.map(|at| at.to_rfc3339()),
            "transactions": transactions,
            "errors": self.errors.len(),
        })
    }
}

impl Default for FlushReport {
    fn default() -> Self {
        Self::new()
    }
}
