use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;
use vwh_core::{CanonicalRow, Relation, RelationLockError, SnapshotRow, StagingRow};

use super::{RunBatch, RunCommit, RunContext, Warehouse};
use crate::merge::{merge_with_rejected, CanonicalTable};
use crate::snapshot::{append_snapshot, SnapshotTable};
use crate::RunError;

/// Process-local warehouse. A run holds all three relations, works on copies
/// of canonical and snapshot and swaps everything in only after every step
/// succeeded.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    staging: Arc<Mutex<Vec<StagingRow>>>,
    canonical: Arc<Mutex<CanonicalTable>>,
    snapshots: Arc<Mutex<SnapshotTable>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(canonical: CanonicalTable, snapshots: SnapshotTable) -> Self {
        Self {
            staging: Arc::default(),
            canonical: Arc::new(Mutex::new(canonical)),
            snapshots: Arc::new(Mutex::new(snapshots)),
        }
    }

    /// Claim exclusive write access to canonical without waiting.
    pub fn try_lock_canonical(&self) -> Result<OwnedMutexGuard<CanonicalTable>, RelationLockError> {
        self.canonical
            .clone()
            .try_lock_owned()
            .map_err(|_| RelationLockError::new(Relation::Canonical))
    }

    pub fn try_lock_snapshots(&self) -> Result<OwnedMutexGuard<SnapshotTable>, RelationLockError> {
        self.snapshots
            .clone()
            .try_lock_owned()
            .map_err(|_| RelationLockError::new(Relation::Snapshot))
    }

    pub fn try_lock_staging(&self) -> Result<OwnedMutexGuard<Vec<StagingRow>>, RelationLockError> {
        self.staging
            .clone()
            .try_lock_owned()
            .map_err(|_| RelationLockError::new(Relation::Staging))
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn commit_run(&self, batch: &RunBatch, ctx: &RunContext) -> Result<RunCommit, RunError> {
        let mut staging = self.try_lock_staging()?;
        let mut canonical = self.try_lock_canonical()?;
        let mut snapshots = self.try_lock_snapshots()?;

        let mut working_canonical = canonical.clone();
        let mut working_snapshots = snapshots.clone();

        let merge_result = merge_with_rejected(
            &mut working_canonical,
            batch.rows.clone(),
            &batch.rejected_ids,
            &ctx.merge,
            ctx.now,
        )?;
        let snapshot_rows = append_snapshot(
            &mut working_snapshots,
            working_canonical.rows(),
            ctx.logical_date,
        )?;

        *staging = batch.staging.clone();
        *canonical = working_canonical;
        *snapshots = working_snapshots;
        info!(
            backend = "memory",
            logical_date = %ctx.logical_date,
            staging_rows = staging.len(),
            canonical_rows = canonical.len(),
            snapshot_rows,
            "run committed"
        );

        Ok(RunCommit {
            merge: merge_result,
            snapshot_rows,
        })
    }

    async fn staging_rows(&self) -> anyhow::Result<Vec<StagingRow>> {
        Ok(self.staging.lock().await.clone())
    }

    async fn canonical_rows(&self) -> anyhow::Result<Vec<CanonicalRow>> {
        Ok(self.canonical.lock().await.rows().cloned().collect())
    }

    async fn snapshot_rows(&self, date: Option<NaiveDate>) -> anyhow::Result<Vec<SnapshotRow>> {
        let snapshots = self.snapshots.lock().await;
        Ok(match date {
            Some(date) => snapshots.rows_for(date).cloned().collect(),
            None => snapshots.rows().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{MergeOptions, RowFailurePolicy};
    use chrono::{TimeZone, Utc};
    use vwh_core::{Metrics, MergeRowReason, TransformedRow};

    fn ctx(day: u32) -> RunContext {
        RunContext {
            logical_date: NaiveDate::from_ymd_opt(2026, 1, day).unwrap(),
            now: Utc.with_ymd_and_hms(2026, 1, 27, 8, 0, 0).single().unwrap(),
            merge: MergeOptions::default(),
        }
    }

    fn row(id: &str, title: Option<&str>) -> TransformedRow {
        TransformedRow {
            entity_id: id.to_string(),
            title: title.map(str::to_string),
            upload_ts: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single(),
            duration_seconds: None,
            duration_interval: None,
            category: None,
            metrics: Metrics {
                views: Some(7),
                likes: None,
                comments: None,
            },
            degraded: true,
        }
    }

    fn staged(id: &str) -> StagingRow {
        StagingRow {
            entity_id: id.to_string(),
            title: None,
            upload_ts: None,
            duration_raw: None,
            metrics: Metrics::default(),
            ingested_at: Utc.with_ymd_and_hms(2026, 1, 27, 8, 0, 0).single().unwrap(),
        }
    }

    fn batch(rows: Vec<TransformedRow>) -> RunBatch {
        RunBatch {
            staging: rows.iter().map(|row| staged(&row.entity_id)).collect(),
            rows,
            ..RunBatch::default()
        }
    }

    #[tokio::test]
    async fn commit_writes_canonical_and_snapshot_together() {
        let warehouse = MemoryWarehouse::new();
        let commit = warehouse
            .commit_run(&batch(vec![row("a", Some("t")), row("b", Some("t"))]), &ctx(27))
            .await
            .expect("commit");

        assert_eq!(commit.merge.inserted, 2);
        assert_eq!(commit.snapshot_rows, 2);
        assert_eq!(warehouse.staging_rows().await.unwrap().len(), 2);
        assert_eq!(warehouse.canonical_rows().await.unwrap().len(), 2);
        assert_eq!(warehouse.snapshot_rows(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_snapshot_rolls_back_the_merge() {
        let warehouse = MemoryWarehouse::new();
        let err = warehouse
            .commit_run(&batch(vec![row("a", Some("t"))]), &ctx(28))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::InvalidLogicalDate(_)));
        assert!(warehouse.staging_rows().await.unwrap().is_empty());
        assert!(warehouse.canonical_rows().await.unwrap().is_empty());
        assert!(warehouse.snapshot_rows(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn aborted_merge_writes_nothing() {
        let warehouse = MemoryWarehouse::new();
        let err = warehouse
            .commit_run(&batch(vec![row("a", Some("t")), row("b", None)]), &ctx(27))
            .await
            .unwrap_err();

        let row_err = match err {
            RunError::MergeRow(row_err) => row_err,
            other => panic!("expected a merge row error, got {other:?}"),
        };
        assert_eq!(row_err.reason, MergeRowReason::MissingTitle);
        assert!(warehouse.canonical_rows().await.unwrap().is_empty());

        let mut skip = ctx(27);
        skip.merge.row_failure = RowFailurePolicy::Skip;
        let commit = warehouse
            .commit_run(&batch(vec![row("a", Some("t")), row("b", None)]), &skip)
            .await
            .expect("skip commit");
        assert_eq!(commit.merge.skipped.len(), 1);
        assert_eq!(commit.snapshot_rows, 1);
    }

    #[tokio::test]
    async fn concurrent_run_on_the_same_relation_is_refused() {
        let warehouse = MemoryWarehouse::new();
        let held = warehouse.try_lock_canonical().expect("first claim");

        let err = warehouse
            .commit_run(&batch(vec![row("a", Some("t"))]), &ctx(27))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(matches!(
            err,
            RunError::RelationLock(RelationLockError {
                relation: Relation::Canonical
            })
        ));
        assert!(
            warehouse.try_lock_staging().is_ok(),
            "a refused run releases its staging claim"
        );
        drop(held);

        warehouse
            .commit_run(&batch(vec![row("a", Some("t"))]), &ctx(27))
            .await
            .expect("commit after release");
    }

    #[tokio::test]
    async fn held_staging_blocks_the_whole_commit() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .commit_run(&batch(vec![row("a", Some("t"))]), &ctx(27))
            .await
            .expect("first run");
        let held = warehouse.try_lock_staging().expect("other run holds staging");

        let err = warehouse
            .commit_run(&batch(vec![row("b", Some("t"))]), &ctx(27))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RunError::RelationLock(RelationLockError {
                relation: Relation::Staging
            })
        ));
        drop(held);
        let canonical = warehouse.canonical_rows().await.unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].entity_id, "a");
        let staging = warehouse.staging_rows().await.unwrap();
        assert_eq!(staging.len(), 1);
        assert_eq!(staging[0].entity_id, "a");
    }

    #[tokio::test]
    async fn staging_is_replaced_not_accumulated() {
        let warehouse = MemoryWarehouse::new();

        warehouse
            .commit_run(&batch(vec![row("a", Some("t")), row("b", Some("t"))]), &ctx(27))
            .await
            .unwrap();
        warehouse
            .commit_run(&batch(vec![row("c", Some("t"))]), &ctx(27))
            .await
            .unwrap();

        let rows = warehouse.staging_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, "c");
    }

    #[tokio::test]
    async fn rejected_entities_survive_a_full_refresh() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .commit_run(&batch(vec![row("a", Some("t")), row("b", Some("t"))]), &ctx(27))
            .await
            .unwrap();

        let mut full = ctx(27);
        full.merge.full_refresh = true;
        let mut refresh = batch(vec![row("a", Some("t"))]);
        refresh.rejected_ids.insert("b".to_string());
        let commit = warehouse.commit_run(&refresh, &full).await.unwrap();

        assert_eq!(commit.merge.deleted, 0);
        assert_eq!(warehouse.canonical_rows().await.unwrap().len(), 2);
    }
}
