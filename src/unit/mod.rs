// ============================================================================
// Unit of Work Module
// ============================================================================
//
// The coordinator owns named, ordered queues of pending tasks and executes
// a selectable subset of them as database transactions; the report records
// what happened to every task.
// ============================================================================

pub mod coordinator;
pub mod report;

pub use coordinator::{FailurePolicy, TransactionRef, UnitOfWork};
pub use report::{FlushReport, FlushStatus, ReportEntry};
