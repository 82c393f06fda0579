//! One warehouse run: landed batch to staging, canonical and snapshot.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use vwh_core::{Clock, MalformedRecordError, SystemClock};
use vwh_rules::{transform_batch, CategoryPolicy};
use vwh_storage::{BatchHandle, LandedBatch, LandingStore};

use crate::config::SyncConfig;
use crate::export::export_run;
use crate::merge::{MergeOptions, MergeResult};
use crate::staging::StagingLoader;
use crate::warehouse::{
    MemoryWarehouse, PgWarehouse, RunBatch, RunCommit, RunContext, Warehouse,
};
use crate::{BackoffPolicy, RunError};

pub const REPORT_FILE: &str = "run_report.json";

/// Scheduler-supplied inputs of one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub batch: BatchHandle,
    pub logical_date: NaiveDate,
    pub full_refresh: bool,
    /// The scheduler's guarantee that every run for an earlier date finished.
    pub prior_run_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Committed, but some records or rows were dropped and are listed.
    CompletedWithSkips,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub backend: String,
    pub batch: BatchHandle,
    pub logical_date: NaiveDate,
    pub full_refresh: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub raw_records: usize,
    pub superseded: usize,
    pub staged: usize,
    pub malformed: Vec<MalformedRecordError>,
    pub merge: MergeResult,
    pub snapshot_rows: usize,
    pub status: RunStatus,
    pub report_dir: Option<String>,
}

impl RunReport {
    pub fn skipped_total(&self) -> usize {
        self.malformed.len() + self.merge.skipped.len()
    }
}

pub struct SyncPipeline {
    landing: LandingStore,
    source_id: String,
    warehouse: Arc<dyn Warehouse>,
    clock: Arc<dyn Clock>,
    policy: CategoryPolicy,
    options: MergeOptions,
    backoff: BackoffPolicy,
    reports_dir: Option<PathBuf>,
}

impl SyncPipeline {
    pub fn new(
        landing: LandingStore,
        warehouse: Arc<dyn Warehouse>,
        clock: Arc<dyn Clock>,
        policy: CategoryPolicy,
    ) -> Self {
        Self {
            landing,
            source_id: "youtube".to_string(),
            warehouse,
            clock,
            policy,
            options: MergeOptions::default(),
            backoff: BackoffPolicy::default(),
            reports_dir: None,
        }
    }

    /// Wire everything from configuration. Postgres is migrated on connect.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let warehouse: Arc<dyn Warehouse> = match &config.database_url {
            Some(url) => {
                let pg = PgWarehouse::connect(url).await?;
                pg.migrate().await?;
                Arc::new(pg)
            }
            None => Arc::new(MemoryWarehouse::new()),
        };
        let policy = CategoryPolicy::from_rules_dir(&config.rules_dir)?;
        Ok(Self::new(
            LandingStore::new(config.landing_dir.clone()),
            warehouse,
            Arc::new(SystemClock),
            policy,
        )
        .with_source_id(config.source_id.clone())
        .with_merge_options(config.merge_options(false))
        .with_reports_dir(config.reports_dir.clone()))
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    pub fn with_merge_options(mut self, options: MergeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn landing(&self) -> &LandingStore {
        &self.landing
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Land a raw API dump for this pipeline's source, stamped with the clock.
    pub async fn land(&self, records: &[JsonValue]) -> Result<LandedBatch> {
        land_batch(&self.landing, &self.source_id, records, self.clock.as_ref()).await
    }

    pub async fn latest_batch(&self) -> Result<Option<BatchHandle>> {
        self.landing.latest_handle(&self.source_id).await
    }

    pub async fn run_once(&self, request: &RunRequest) -> Result<RunReport, RunError> {
        if !request.prior_run_complete {
            return Err(RunError::PriorRunIncomplete {
                logical_date: request.logical_date,
            });
        }

        let run_id = Uuid::new_v4();
        let span = info_span!(
            "warehouse_run",
            %run_id,
            logical_date = %request.logical_date,
            batch = %request.batch,
            backend = self.warehouse.backend(),
        );
        self.execute(run_id, request).instrument(span).await
    }

    async fn execute(&self, run_id: Uuid, request: &RunRequest) -> Result<RunReport, RunError> {
        let started_at = self.clock.now();

        let records = self.landing.read_latest(&request.batch).await?;
        let staging = StagingLoader::new(self.clock.clone()).load(records);
        let batch = RunBatch {
            rows: transform_batch(&staging.rows, &self.policy),
            rejected_ids: staging.rejected_ids(),
            staging: staging.rows.clone(),
        };
        let ctx = RunContext {
            logical_date: request.logical_date,
            now: self.clock.now(),
            merge: MergeOptions {
                full_refresh: self.options.full_refresh || request.full_refresh,
                ..self.options
            },
        };
        let RunCommit {
            merge,
            snapshot_rows,
        } = self
            .retry("commit run", || self.warehouse.commit_run(&batch, &ctx))
            .await?;

        let status = if staging.malformed.is_empty() && merge.skipped.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithSkips
        };
        let mut report = RunReport {
            run_id,
            backend: self.warehouse.backend().to_string(),
            batch: request.batch.clone(),
            logical_date: request.logical_date,
            full_refresh: ctx.merge.full_refresh,
            started_at,
            finished_at: self.clock.now(),
            raw_records: staging.raw_records,
            superseded: staging.superseded,
            staged: staging.rows.len(),
            malformed: staging.malformed,
            merge,
            snapshot_rows,
            status,
            report_dir: None,
        };

        // Already committed: export failures are reported, not returned.
        if let Some(reports_dir) = &self.reports_dir {
            if let Err(err) = self.write_report(reports_dir, &mut report).await {
                report.report_dir = None;
                warn!(error = %format!("{err:#}"), "run report not written");
            }
        }

        info!(
            inserted = report.merge.inserted,
            updated = report.merge.updated,
            unchanged = report.merge.unchanged,
            deleted = report.merge.deleted,
            skipped = report.skipped_total(),
            snapshot_rows = report.snapshot_rows,
            status = ?report.status,
            "warehouse run finished"
        );
        if report.status == RunStatus::CompletedWithSkips {
            warn!(
                malformed = report.malformed.len(),
                merge_skipped = report.merge.skipped.len(),
                "run dropped records; see the run report for reasons"
            );
        }
        Ok(report)
    }

    async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RunError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RunError>>,
    {
        let mut attempt = 0usize;
        loop {
            match op().await {
                Err(err) if err.is_retryable() && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(what, attempt, delay_ms = delay.as_millis() as u64, %err, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Write `<reports_dir>/<run_id>/run_report.json` and the parquet exports.
    async fn write_report(&self, reports_dir: &Path, report: &mut RunReport) -> Result<()> {
        let run_dir = reports_dir.join(report.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;
        report.report_dir = Some(run_dir.display().to_string());

        let canonical = self.warehouse.canonical_rows().await?;
        let snapshots = self
            .warehouse
            .snapshot_rows(Some(report.logical_date))
            .await?;
        export_run(&run_dir, report.logical_date, &canonical, &snapshots)?;

        let bytes = serde_json::to_vec_pretty(&*report).context("serializing run report")?;
        let path = run_dir.join(REPORT_FILE);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Land `records` for `source_id` with the ingestion time taken from `clock`.
pub async fn land_batch(
    landing: &LandingStore,
    source_id: &str,
    records: &[JsonValue],
    clock: &dyn Clock,
) -> Result<LandedBatch> {
    landing.put(source_id, records, clock.now()).await
}

/// Markdown digest of the most recent `runs` run reports, newest first.
pub fn report_runs_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut reports = Vec::new();
    for entry in std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path().join(REPORT_FILE);
        if !path.exists() {
            continue;
        }
        let value: JsonValue = serde_json::from_str(
            &std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        reports.push(value);
    }
    let started = |v: &JsonValue| {
        v.get("started_at")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string()
    };
    reports.sort_by_key(|v| std::cmp::Reverse(started(v)));

    let count = |v: &JsonValue, key: &str| {
        v.get("merge")
            .and_then(|m| m.get(key))
            .and_then(|n| n.as_u64())
            .unwrap_or(0)
    };
    let len = |v: &JsonValue, pointer: &str| {
        v.pointer(pointer)
            .and_then(|a| a.as_array())
            .map(|a| a.len())
            .unwrap_or(0)
    };
    let text = |v: &JsonValue, key: &str| {
        v.get(key)
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string()
    };

    let mut lines = vec!["# Warehouse Runs".to_string(), String::new()];
    for report in reports.iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", text(report, "run_id")));
        lines.push(format!("- logical date: {}", text(report, "logical_date")));
        lines.push(format!("- status: {}", text(report, "status")));
        lines.push(format!("- backend: {}", text(report, "backend")));
        lines.push(format!(
            "- inserted/updated/unchanged/deleted: {}/{}/{}/{}",
            count(report, "inserted"),
            count(report, "updated"),
            count(report, "unchanged"),
            count(report, "deleted"),
        ));
        lines.push(format!(
            "- skipped: {} malformed, {} merge",
            len(report, "/malformed"),
            len(report, "/merge/skipped"),
        ));
        lines.push(format!(
            "- snapshot rows: {}",
            report
                .get("snapshot_rows")
                .and_then(|n| n.as_u64())
                .unwrap_or(0)
        ));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use vwh_core::{FixedClock, Relation};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 8, 0, 0).single().unwrap()
    }

    fn pipeline(root: &Path, warehouse: Arc<dyn Warehouse>, day: u32) -> SyncPipeline {
        SyncPipeline::new(
            LandingStore::new(root.join("landing")),
            warehouse,
            Arc::new(FixedClock(at(day))),
            CategoryPolicy::default(),
        )
        .with_backoff(BackoffPolicy {
            max_retries: 2,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
        })
    }

    fn request(batch: BatchHandle, day: u32) -> RunRequest {
        RunRequest {
            batch,
            logical_date: NaiveDate::from_ymd_opt(2026, 1, day).unwrap(),
            full_refresh: false,
            prior_run_complete: true,
        }
    }

    fn video(id: &str, views: &str) -> JsonValue {
        json!({
            "video_id": id,
            "title": format!("video {id}"),
            "publishedAt": "2025-11-02T09:30:00Z",
            "duration": "PT45S",
            "viewCount": views,
            "likeCount": "3",
            "commentCount": "0"
        })
    }

    #[tokio::test]
    async fn runs_a_landed_batch_end_to_end_and_writes_reports() {
        let dir = tempfile::tempdir().unwrap();
        let reports = dir.path().join("reports");
        let pipeline = pipeline(dir.path(), Arc::new(MemoryWarehouse::new()), 27)
            .with_reports_dir(&reports);

        let landed = pipeline
            .land(&[video("a", "10"), video("b", "20"), json!({"title": "orphan"})])
            .await
            .unwrap();
        let report = pipeline.run_once(&request(landed.handle, 27)).await.unwrap();

        assert_eq!(report.raw_records, 3);
        assert_eq!(report.staged, 2);
        assert_eq!(report.merge.inserted, 2);
        assert_eq!(report.snapshot_rows, 2);
        assert_eq!(report.status, RunStatus::CompletedWithSkips);
        assert_eq!(report.skipped_total(), 1);

        let run_dir = PathBuf::from(report.report_dir.clone().unwrap());
        assert!(run_dir.join(REPORT_FILE).exists());
        assert!(run_dir.join("snapshots").join("manifest.json").exists());

        let markdown = report_runs_markdown(5, &reports).unwrap();
        assert!(markdown.contains(&report.run_id.to_string()));
        assert!(markdown.contains("inserted/updated/unchanged/deleted: 2/0/0/0"));
        assert!(markdown.contains("skipped: 1 malformed, 0 merge"));
    }

    #[tokio::test]
    async fn incomplete_prior_run_blocks_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = Arc::new(MemoryWarehouse::new());
        let pipeline = pipeline(dir.path(), warehouse.clone(), 27);
        let landed = pipeline.land(&[video("a", "1")]).await.unwrap();

        let mut req = request(landed.handle, 27);
        req.prior_run_complete = false;
        let err = pipeline.run_once(&req).await.unwrap_err();

        assert!(matches!(err, RunError::PriorRunIncomplete { .. }));
        assert!(warehouse.staging_rows().await.unwrap().is_empty());
        assert!(warehouse.canonical_rows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn held_relation_lock_surfaces_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = Arc::new(MemoryWarehouse::new());
        let pipeline = pipeline(dir.path(), warehouse.clone(), 27);
        let landed = pipeline.land(&[video("a", "1")]).await.unwrap();

        let held = warehouse.try_lock_snapshots().unwrap();
        let err = pipeline
            .run_once(&request(landed.handle.clone(), 27))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::RelationLock(ref lock) if lock.relation == Relation::Snapshot
        ));
        assert!(warehouse.staging_rows().await.unwrap().is_empty());
        assert!(warehouse.canonical_rows().await.unwrap().is_empty());

        drop(held);
        let report = pipeline.run_once(&request(landed.handle, 27)).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn request_full_refresh_overrides_incremental_default() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = Arc::new(MemoryWarehouse::new());
        let pipeline = pipeline(dir.path(), warehouse.clone(), 27);

        let first = pipeline
            .land(&[video("a", "1"), video("b", "1"), video("c", "1")])
            .await
            .unwrap();
        pipeline.run_once(&request(first.handle, 27)).await.unwrap();

        let second = pipeline
            .land(&[video("a", "2"), video("c", "2")])
            .await
            .unwrap();
        let mut req = request(second.handle, 27);
        req.full_refresh = true;
        let report = pipeline.run_once(&req).await.unwrap();

        assert!(report.full_refresh);
        assert_eq!(report.merge.deleted, 1);
        let ids: Vec<String> = warehouse
            .canonical_rows()
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.entity_id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn staging_held_by_another_run_blocks_the_commit() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = Arc::new(MemoryWarehouse::new());
        let pipeline = pipeline(dir.path(), warehouse.clone(), 27);
        let first = pipeline.land(&[video("a", "1")]).await.unwrap();
        pipeline.run_once(&request(first.handle, 27)).await.unwrap();

        let second = pipeline.land(&[video("b", "1")]).await.unwrap();
        let held = warehouse.try_lock_staging().unwrap();
        let err = pipeline.run_once(&request(second.handle, 27)).await.unwrap_err();
        drop(held);

        assert!(matches!(
            err,
            RunError::RelationLock(ref lock) if lock.relation == Relation::Staging
        ));
        let staged: Vec<String> = warehouse
            .staging_rows()
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.entity_id)
            .collect();
        assert_eq!(staged, vec!["a".to_string()]);
        assert_eq!(warehouse.canonical_rows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn full_refresh_keeps_an_entity_whose_record_was_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = Arc::new(MemoryWarehouse::new());
        let pipeline = pipeline(dir.path(), warehouse.clone(), 27);
        let seed = pipeline
            .land(&[video("A", "1"), video("B", "1")])
            .await
            .unwrap();
        pipeline.run_once(&request(seed.handle, 27)).await.unwrap();

        let refresh = pipeline
            .land(&[video("A", "2"), video("B", "-5")])
            .await
            .unwrap();
        let mut req = request(refresh.handle, 27);
        req.full_refresh = true;
        let report = pipeline.run_once(&req).await.unwrap();

        assert_eq!(report.malformed.len(), 1);
        assert_eq!(report.malformed[0].entity_id.as_deref(), Some("B"));
        assert_eq!(report.merge.deleted, 0);
        let canonical = warehouse.canonical_rows().await.unwrap();
        let ids: Vec<&str> = canonical.iter().map(|row| row.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(canonical[1].metrics.views, Some(1));
    }

    #[tokio::test]
    async fn unwritable_reports_dir_does_not_fail_a_committed_run() {
        let dir = tempfile::tempdir().unwrap();
        let occupied = dir.path().join("reports");
        std::fs::write(&occupied, b"not a directory").unwrap();
        let warehouse = Arc::new(MemoryWarehouse::new());
        let pipeline = pipeline(dir.path(), warehouse.clone(), 27).with_reports_dir(&occupied);
        let landed = pipeline.land(&[video("a", "1")]).await.unwrap();

        let report = pipeline.run_once(&request(landed.handle, 27)).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.report_dir, None);
        assert_eq!(warehouse.canonical_rows().await.unwrap().len(), 1);
        assert_eq!(warehouse.snapshot_rows(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn land_batch_stamps_the_batch_with_the_given_clock() {
        let dir = tempfile::tempdir().unwrap();
        let landing = LandingStore::new(dir.path());

        let landed = land_batch(&landing, "youtube", &[video("a", "1")], &FixedClock(at(26)))
            .await
            .unwrap();

        assert_eq!(landed.handle.ingested_at, at(26));
        let records = landing.read_latest(&landed.handle).await.unwrap();
        assert_eq!(records[0].ingested_at, at(26));
    }
}
