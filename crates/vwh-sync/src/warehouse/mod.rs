//! Transactional homes for the staging, canonical and snapshot relations.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use vwh_core::{CanonicalRow, SnapshotRow, StagingRow, TransformedRow};

use crate::merge::{MergeOptions, MergeResult};
use crate::RunError;

mod memory;
mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

/// Inputs of one merge-plus-snapshot commit.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub logical_date: NaiveDate,
    pub now: DateTime<Utc>,
    pub merge: MergeOptions,
}

/// Everything one run writes, staged from a single landed batch.
#[derive(Debug, Clone, Default)]
pub struct RunBatch {
    /// Replaces the whole staging relation.
    pub staging: Vec<StagingRow>,
    pub rows: Vec<TransformedRow>,
    /// Entities whose records were in the batch but rejected at staging.
    /// A full refresh never deletes them.
    pub rejected_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunCommit {
    pub merge: MergeResult,
    pub snapshot_rows: usize,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Replace staging, merge into canonical and append the logical date's
    /// snapshot as one unit under claims on all three relations. Either
    /// everything lands or nothing does.
    async fn commit_run(&self, batch: &RunBatch, ctx: &RunContext) -> Result<RunCommit, RunError>;

    async fn staging_rows(&self) -> anyhow::Result<Vec<StagingRow>>;

    /// Canonical rows ordered by identifier, tombstones included.
    async fn canonical_rows(&self) -> anyhow::Result<Vec<CanonicalRow>>;

    /// Snapshot rows ordered by (identifier, date), optionally for one date.
    async fn snapshot_rows(&self, date: Option<NaiveDate>) -> anyhow::Result<Vec<SnapshotRow>>;
}
