//! Warehouse run orchestration: staging, transformation, canonical merge and
//! daily snapshots.

use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;
use vwh_core::{InvalidLogicalDateError, MergeRowError, RelationLockError};

pub mod config;
pub mod export;
pub mod merge;
pub mod pipeline;
pub mod snapshot;
pub mod staging;
pub mod warehouse;

pub use config::SyncConfig;
pub use merge::{
    merge, merge_with_rejected, CanonicalTable, DeletePolicy, MergeOptions, MergeResult,
    RowFailurePolicy,
};
pub use pipeline::{
    land_batch, report_runs_markdown, RunReport, RunRequest, RunStatus, SyncPipeline,
};
pub use snapshot::{append_snapshot, SnapshotTable};
pub use staging::{StagingLoader, StagingOutcome};
pub use warehouse::{
    MemoryWarehouse, PgWarehouse, RunBatch, RunCommit, RunContext, Warehouse,
};

pub const CRATE_NAME: &str = "vwh-sync";

/// Run-level failures. Row-level problems only surface here when the row
/// failure policy escalates them.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("prior run for a date before {logical_date} has not completed")]
    PriorRunIncomplete { logical_date: NaiveDate },
    #[error(transparent)]
    RelationLock(#[from] RelationLockError),
    #[error("merge aborted: {0}")]
    MergeRow(#[from] MergeRowError),
    #[error(transparent)]
    InvalidLogicalDate(#[from] InvalidLogicalDateError),
    #[error("warehouse database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl RunError {
    /// Only lock contention is worth retrying; every other failure repeats.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RelationLock(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}
