use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;
use vwh_core::{
    CanonicalRow, DurationInterval, Metrics, Relation, RelationLockError, SnapshotRow, StagingRow,
};

use super::{RunBatch, RunCommit, RunContext, Warehouse};
use crate::merge::{merge_with_rejected, CanonicalTable};
use crate::snapshot::snapshot_rows_for;
use crate::RunError;

const CANONICAL_COLUMNS: &str = r#"
    entity_id, title, upload_ts, duration_seconds,
    duration_days, duration_hours, duration_minutes, duration_seconds_part,
    category, views, likes, comments, degraded, refreshed_at, deleted_at
"#;

/// Warehouse on Postgres. Each run holds transaction-scoped advisory locks on
/// the relations it writes, so a second concurrent run fails fast instead of
/// interleaving with the first.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to warehouse database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying warehouse migrations")?;
        Ok(())
    }
}

fn lock_key(relation: Relation) -> i64 {
    match relation {
        Relation::Staging => 0x7677_6800_0001,
        Relation::Canonical => 0x7677_6800_0002,
        Relation::Snapshot => 0x7677_6800_0003,
    }
}

async fn try_claim(
    tx: &mut Transaction<'_, Postgres>,
    relation: Relation,
) -> Result<(), RunError> {
    let claimed: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
        .bind(lock_key(relation))
        .fetch_one(&mut **tx)
        .await?;
    if claimed {
        Ok(())
    } else {
        Err(RelationLockError::new(relation).into())
    }
}

fn to_db_count(value: Option<u64>, column: &str) -> anyhow::Result<Option<i64>> {
    value
        .map(|v| i64::try_from(v).with_context(|| format!("{column} {v} exceeds BIGINT")))
        .transpose()
}

fn from_db_count(value: Option<i64>, column: &str) -> anyhow::Result<Option<u64>> {
    value
        .map(|v| u64::try_from(v).with_context(|| format!("negative {column} {v} in warehouse")))
        .transpose()
}

fn metrics_from_row(row: &PgRow) -> anyhow::Result<Metrics> {
    Ok(Metrics {
        views: from_db_count(row.try_get("views")?, "views")?,
        likes: from_db_count(row.try_get("likes")?, "likes")?,
        comments: from_db_count(row.try_get("comments")?, "comments")?,
    })
}

fn canonical_from_row(row: &PgRow) -> anyhow::Result<CanonicalRow> {
    let days: Option<i64> = row.try_get("duration_days")?;
    let hours: Option<i16> = row.try_get("duration_hours")?;
    let minutes: Option<i16> = row.try_get("duration_minutes")?;
    let seconds: Option<i16> = row.try_get("duration_seconds_part")?;
    let duration_interval = match (days, hours, minutes, seconds) {
        (Some(d), Some(h), Some(m), Some(s)) => Some(DurationInterval {
            days: u64::try_from(d).context("negative duration_days")?,
            hours: u8::try_from(h).context("duration_hours out of range")?,
            minutes: u8::try_from(m).context("duration_minutes out of range")?,
            seconds: u8::try_from(s).context("duration_seconds_part out of range")?,
        }),
        (None, None, None, None) => None,
        _ => return Err(anyhow!("partially populated duration interval")),
    };
    let duration_seconds: Option<i64> = row.try_get("duration_seconds")?;

    Ok(CanonicalRow {
        entity_id: row.try_get("entity_id")?,
        title: row.try_get("title")?,
        upload_ts: row.try_get("upload_ts")?,
        duration_seconds: from_db_count(duration_seconds, "duration_seconds")?,
        duration_interval,
        category: row.try_get("category")?,
        metrics: metrics_from_row(row)?,
        degraded: row.try_get("degraded")?,
        refreshed_at: row.try_get("refreshed_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> anyhow::Result<SnapshotRow> {
    Ok(SnapshotRow {
        entity_id: row.try_get("entity_id")?,
        snapshot_date: row.try_get("snapshot_date")?,
        metrics: metrics_from_row(row)?,
        inserted_at: row.try_get("inserted_at")?,
    })
}

async fn upsert_canonical(
    tx: &mut Transaction<'_, Postgres>,
    row: &CanonicalRow,
) -> Result<(), RunError> {
    let interval = row.duration_interval;
    let duration_seconds = to_db_count(row.duration_seconds, "duration_seconds")?;
    let duration_days = to_db_count(interval.map(|i| i.days), "duration_days")?;
    sqlx::query(
        r#"
        INSERT INTO canonical_videos (
            entity_id, title, upload_ts, duration_seconds,
            duration_days, duration_hours, duration_minutes, duration_seconds_part,
            category, views, likes, comments, degraded, refreshed_at, deleted_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (entity_id) DO UPDATE SET
            title = EXCLUDED.title,
            upload_ts = EXCLUDED.upload_ts,
            duration_seconds = EXCLUDED.duration_seconds,
            duration_days = EXCLUDED.duration_days,
            duration_hours = EXCLUDED.duration_hours,
            duration_minutes = EXCLUDED.duration_minutes,
            duration_seconds_part = EXCLUDED.duration_seconds_part,
            category = EXCLUDED.category,
            views = EXCLUDED.views,
            likes = EXCLUDED.likes,
            comments = EXCLUDED.comments,
            degraded = EXCLUDED.degraded,
            refreshed_at = EXCLUDED.refreshed_at,
            deleted_at = EXCLUDED.deleted_at
        "#,
    )
    .bind(&row.entity_id)
    .bind(&row.title)
    .bind(row.upload_ts)
    .bind(duration_seconds)
    .bind(duration_days)
    .bind(interval.map(|i| i16::from(i.hours)))
    .bind(interval.map(|i| i16::from(i.minutes)))
    .bind(interval.map(|i| i16::from(i.seconds)))
    .bind(&row.category)
    .bind(to_db_count(row.metrics.views, "views")?)
    .bind(to_db_count(row.metrics.likes, "likes")?)
    .bind(to_db_count(row.metrics.comments, "comments")?)
    .bind(row.degraded)
    .bind(row.refreshed_at)
    .bind(row.deleted_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// A rerun of the same date replaces the counts; `inserted_at` keeps its first value.
async fn upsert_snapshot(
    tx: &mut Transaction<'_, Postgres>,
    row: &SnapshotRow,
) -> Result<(), RunError> {
    sqlx::query(
        r#"
        INSERT INTO video_metrics_daily (
            entity_id, snapshot_date, views, likes, comments, inserted_at
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (entity_id, snapshot_date) DO UPDATE SET
            views = EXCLUDED.views,
            likes = EXCLUDED.likes,
            comments = EXCLUDED.comments
        "#,
    )
    .bind(&row.entity_id)
    .bind(row.snapshot_date)
    .bind(to_db_count(row.metrics.views, "views")?)
    .bind(to_db_count(row.metrics.likes, "likes")?)
    .bind(to_db_count(row.metrics.comments, "comments")?)
    .bind(row.inserted_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_staging(
    tx: &mut Transaction<'_, Postgres>,
    row: &StagingRow,
) -> Result<(), RunError> {
    sqlx::query(
        r#"
        INSERT INTO staging_videos (
            entity_id, title, upload_ts, duration_raw, views, likes, comments, ingested_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&row.entity_id)
    .bind(&row.title)
    .bind(row.upload_ts)
    .bind(&row.duration_raw)
    .bind(to_db_count(row.metrics.views, "views")?)
    .bind(to_db_count(row.metrics.likes, "likes")?)
    .bind(to_db_count(row.metrics.comments, "comments")?)
    .bind(row.ingested_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn commit_run(&self, batch: &RunBatch, ctx: &RunContext) -> Result<RunCommit, RunError> {
        let mut tx = self.pool.begin().await?;
        try_claim(&mut tx, Relation::Staging).await?;
        try_claim(&mut tx, Relation::Canonical).await?;
        try_claim(&mut tx, Relation::Snapshot).await?;

        sqlx::query("DELETE FROM staging_videos")
            .execute(&mut *tx)
            .await?;
        for row in &batch.staging {
            insert_staging(&mut tx, row).await?;
        }

        let existing = sqlx::query(&format!(
            "SELECT {CANONICAL_COLUMNS} FROM canonical_videos ORDER BY entity_id"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let mut table = CanonicalTable::from_rows(
            existing
                .iter()
                .map(canonical_from_row)
                .collect::<anyhow::Result<Vec<_>>>()?,
        );

        // Any early return drops `tx`, which rolls the whole run back.
        let merge_result = merge_with_rejected(
            &mut table,
            batch.rows.clone(),
            &batch.rejected_ids,
            &ctx.merge,
            ctx.now,
        )?;
        let snapshot = snapshot_rows_for(table.rows(), ctx.logical_date)?;

        for entity_id in &merge_result.written_ids {
            if let Some(row) = table.get(entity_id) {
                upsert_canonical(&mut tx, row).await?;
            }
        }
        if !merge_result.removed_ids.is_empty() {
            sqlx::query("DELETE FROM canonical_videos WHERE entity_id = ANY($1)")
                .bind(&merge_result.removed_ids)
                .execute(&mut *tx)
                .await?;
        }
        for row in &snapshot {
            upsert_snapshot(&mut tx, row).await?;
        }

        tx.commit().await?;
        info!(
            backend = "postgres",
            logical_date = %ctx.logical_date,
            staged = batch.staging.len(),
            written = merge_result.written_ids.len(),
            removed = merge_result.removed_ids.len(),
            snapshot_rows = snapshot.len(),
            "run committed"
        );

        Ok(RunCommit {
            snapshot_rows: snapshot.len(),
            merge: merge_result,
        })
    }

    async fn staging_rows(&self) -> anyhow::Result<Vec<StagingRow>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, title, upload_ts, duration_raw, views, likes, comments, ingested_at
              FROM staging_videos
             ORDER BY entity_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("reading staging_videos")?;

        rows.iter()
            .map(|row| -> anyhow::Result<StagingRow> {
                Ok(StagingRow {
                    entity_id: row.try_get("entity_id")?,
                    title: row.try_get("title")?,
                    upload_ts: row.try_get("upload_ts")?,
                    duration_raw: row.try_get("duration_raw")?,
                    metrics: metrics_from_row(row)?,
                    ingested_at: row.try_get("ingested_at")?,
                })
            })
            .collect()
    }

    async fn canonical_rows(&self) -> anyhow::Result<Vec<CanonicalRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {CANONICAL_COLUMNS} FROM canonical_videos ORDER BY entity_id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("reading canonical_videos")?;
        rows.iter().map(canonical_from_row).collect()
    }

    async fn snapshot_rows(&self, date: Option<NaiveDate>) -> anyhow::Result<Vec<SnapshotRow>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, snapshot_date, views, likes, comments, inserted_at
              FROM video_metrics_daily
             WHERE $1::date IS NULL OR snapshot_date = $1
             ORDER BY entity_id, snapshot_date
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .context("reading video_metrics_daily")?;
        rows.iter().map(snapshot_from_row).collect()
    }
}
