//! Parquet exports of the warehouse relations written next to each run report.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Date32Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use vwh_core::{CanonicalRow, SnapshotRow};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub logical_date: NaiveDate,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `canonical_videos.parquet` and `video_metrics_daily.parquet` under
/// `<run_dir>/snapshots/` plus a manifest of their hashes.
pub fn export_run(
    run_dir: &Path,
    logical_date: NaiveDate,
    canonical: &[CanonicalRow],
    snapshots: &[SnapshotRow],
) -> Result<ParquetManifest> {
    let snapshot_dir = run_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let canonical_path = snapshot_dir.join("canonical_videos.parquet");
    let metrics_path = snapshot_dir.join("video_metrics_daily.parquet");
    write_parquet(&canonical_path, canonical_batch(canonical)?)?;
    write_parquet(&metrics_path, snapshot_batch(snapshots)?)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        logical_date,
        files: vec![
            manifest_entry("canonical_videos", run_dir, &canonical_path, canonical.len())?,
            manifest_entry("video_metrics_daily", run_dir, &metrics_path, snapshots.len())?,
        ],
    };
    let manifest_path = snapshot_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

fn canonical_batch(rows: &[CanonicalRow]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("upload_ts", DataType::Utf8, false),
        ArrowField::new("duration_seconds", DataType::UInt64, true),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("views", DataType::UInt64, true),
        ArrowField::new("likes", DataType::UInt64, true),
        ArrowField::new("comments", DataType::UInt64, true),
        ArrowField::new("degraded", DataType::Boolean, false),
        ArrowField::new("refreshed_at", DataType::Utf8, false),
        ArrowField::new("deleted_at", DataType::Utf8, true),
    ]));

    let entity_ids = StringArray::from(
        rows.iter()
            .map(|r| Some(r.entity_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(rows.iter().map(|r| Some(r.title.as_str())).collect::<Vec<_>>());
    let upload_ts = StringArray::from(
        rows.iter()
            .map(|r| Some(r.upload_ts.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let durations = UInt64Array::from(rows.iter().map(|r| r.duration_seconds).collect::<Vec<_>>());
    let categories =
        StringArray::from(rows.iter().map(|r| r.category.as_deref()).collect::<Vec<_>>());
    let views = UInt64Array::from(rows.iter().map(|r| r.metrics.views).collect::<Vec<_>>());
    let likes = UInt64Array::from(rows.iter().map(|r| r.metrics.likes).collect::<Vec<_>>());
    let comments = UInt64Array::from(rows.iter().map(|r| r.metrics.comments).collect::<Vec<_>>());
    let degraded = BooleanArray::from(rows.iter().map(|r| r.degraded).collect::<Vec<_>>());
    let refreshed_at = StringArray::from(
        rows.iter()
            .map(|r| Some(r.refreshed_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let deleted_at = StringArray::from(
        rows.iter()
            .map(|r| r.deleted_at.map(|ts| ts.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(entity_ids),
            Arc::new(titles),
            Arc::new(upload_ts),
            Arc::new(durations),
            Arc::new(categories),
            Arc::new(views),
            Arc::new(likes),
            Arc::new(comments),
            Arc::new(degraded),
            Arc::new(refreshed_at),
            Arc::new(deleted_at),
        ],
    )
    .context("building canonical_videos record batch")
}

fn snapshot_batch(rows: &[SnapshotRow]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_id", DataType::Utf8, false),
        ArrowField::new("snapshot_date", DataType::Date32, false),
        ArrowField::new("views", DataType::UInt64, true),
        ArrowField::new("likes", DataType::UInt64, true),
        ArrowField::new("comments", DataType::UInt64, true),
        ArrowField::new("inserted_at", DataType::Utf8, false),
    ]));

    let entity_ids = StringArray::from(
        rows.iter()
            .map(|r| Some(r.entity_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let dates = Date32Array::from(
        rows.iter()
            .map(|r| days_since_epoch(r.snapshot_date))
            .collect::<Vec<_>>(),
    );
    let views = UInt64Array::from(rows.iter().map(|r| r.metrics.views).collect::<Vec<_>>());
    let likes = UInt64Array::from(rows.iter().map(|r| r.metrics.likes).collect::<Vec<_>>());
    let comments = UInt64Array::from(rows.iter().map(|r| r.metrics.comments).collect::<Vec<_>>());
    let inserted_at = StringArray::from(
        rows.iter()
            .map(|r| Some(r.inserted_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(entity_ids),
            Arc::new(dates),
            Arc::new(views),
            Arc::new(likes),
            Arc::new(comments),
            Arc::new(inserted_at),
        ],
    )
    .context("building video_metrics_daily record batch")
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use vwh_core::Metrics;

    #[test]
    fn writes_both_relations_with_hashed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2026, 1, 27, 8, 0, 0).single().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 1, 27).unwrap();
        let metrics = Metrics {
            views: Some(10),
            likes: None,
            comments: Some(0),
        };
        let canonical = vec![CanonicalRow {
            entity_id: "abc".into(),
            title: "clip".into(),
            upload_ts: at,
            duration_seconds: None,
            duration_interval: None,
            category: None,
            metrics,
            degraded: true,
            refreshed_at: at,
            deleted_at: None,
        }];
        let snapshots = vec![SnapshotRow {
            entity_id: "abc".into(),
            snapshot_date: date,
            metrics,
            inserted_at: at,
        }];

        let manifest = export_run(dir.path(), date, &canonical, &snapshots).unwrap();

        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            let path = dir.path().join(&file.path);
            let bytes = std::fs::read(&path).unwrap();
            assert_eq!(file.bytes, bytes.len() as u64);
            assert_eq!(file.sha256.len(), 64);
            assert_eq!(file.rows, 1);
        }
        assert!(dir.path().join("snapshots").join(MANIFEST_FILE).exists());
    }

    #[test]
    fn epoch_offsets_match_arrow_date32() {
        assert_eq!(days_since_epoch(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()), 1);
        assert_eq!(days_since_epoch(NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()), 10_957);
    }
}
