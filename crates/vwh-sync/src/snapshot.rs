//! Daily metrics history keyed by (entity, logical date).

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::debug;
use vwh_core::{CanonicalRow, InvalidLogicalDateError, SnapshotRow};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotTable {
    rows: BTreeMap<(String, NaiveDate), SnapshotRow>,
}

impl SnapshotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = SnapshotRow>) -> Self {
        Self {
            rows: rows
                .into_iter()
                .map(|row| ((row.entity_id.clone(), row.snapshot_date), row))
                .collect(),
        }
    }

    pub fn get(&self, entity_id: &str, date: NaiveDate) -> Option<&SnapshotRow> {
        self.rows.get(&(entity_id.to_string(), date))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &SnapshotRow> {
        self.rows.values()
    }

    pub fn rows_for(&self, date: NaiveDate) -> impl Iterator<Item = &SnapshotRow> {
        self.rows.values().filter(move |row| row.snapshot_date == date)
    }
}

/// Build the snapshot rows for `logical_date` from the live canonical rows.
///
/// The data's refresh date is the most recent `refreshed_at` among them; a
/// logical date after it fails before anything is produced. Rows an
/// incremental batch did not touch are snapshotted with their stored values.
pub fn snapshot_rows_for<'a>(
    canonical_rows: impl IntoIterator<Item = &'a CanonicalRow>,
    logical_date: NaiveDate,
) -> Result<Vec<SnapshotRow>, InvalidLogicalDateError> {
    let live: Vec<&CanonicalRow> = canonical_rows
        .into_iter()
        .filter(|row| row.is_live())
        .collect();

    if let Some(freshest) = live.iter().max_by_key(|row| row.refreshed_at) {
        let refreshed_on = freshest.refreshed_at.date_naive();
        if logical_date > refreshed_on {
            return Err(InvalidLogicalDateError {
                logical_date,
                refreshed_on,
                entity_id: freshest.entity_id.clone(),
            });
        }
    }

    Ok(live
        .into_iter()
        .map(|row| SnapshotRow {
            entity_id: row.entity_id.clone(),
            snapshot_date: logical_date,
            metrics: row.metrics,
            inserted_at: row.refreshed_at,
        })
        .collect())
}

/// Insert or replace one row per live canonical entity for `logical_date`.
/// Rows for every other date are left alone. A replaced row keeps its
/// original `inserted_at`. Returns the number of rows written.
pub fn append_snapshot<'a>(
    snapshots: &mut SnapshotTable,
    canonical_rows: impl IntoIterator<Item = &'a CanonicalRow>,
    logical_date: NaiveDate,
) -> Result<usize, InvalidLogicalDateError> {
    let rows = snapshot_rows_for(canonical_rows, logical_date)?;
    let written = rows.len();
    let mut replaced = 0usize;
    for mut row in rows {
        let key = (row.entity_id.clone(), row.snapshot_date);
        if let Some(existing) = snapshots.rows.get(&key) {
            row.inserted_at = existing.inserted_at;
            replaced += 1;
        }
        snapshots.rows.insert(key, row);
    }
    debug!(%logical_date, written, replaced, "snapshot appended");
    Ok(written)
}
