// ABOUTME: Incremental table synchronization core
// ABOUTME: Reconciler, differ, audit writer, and the paginated sync driver

pub mod audit;
pub mod differ;
pub mod driver;
pub mod reconciler;

pub use differ::{BatchDiff, ChangeRecord, RowSnapshot};
pub use driver::SyncDriver;
pub use reconciler::{plan_columns, ReconcilePlan};

use crate::error::SyncError;

/// Counters accumulated across committed pages. Reported, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncTotals {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub scanned: u64,
}

/// Terminal status of a sync run.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Every page committed.
    Success,
    /// At least one page committed before the run stopped on `error`.
    PartialFailure(SyncError),
    /// The run failed before any page committed.
    Fatal(SyncError),
}

/// What a sync run did. The totals always reflect committed pages, even when
/// the outcome is a failure.
#[derive(Debug)]
pub struct SyncReport {
    pub totals: SyncTotals,
    pub outcome: SyncOutcome,
    pub pages: u64,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SyncOutcome::Success)
    }
}
