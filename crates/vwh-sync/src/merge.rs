//! Canonical current-state reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vwh_core::{CanonicalRow, MergeRowError, MergeRowReason, Metrics, TransformedRow};

/// What happens to a batch when one of its rows cannot be applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFailurePolicy {
    /// Refuse the whole merge and leave canonical untouched.
    #[default]
    Abort,
    /// Apply every valid row and report the failures.
    Skip,
}

impl FromStr for RowFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown row failure policy `{other}` (expected abort|skip)")),
        }
    }
}

/// How a full refresh retires entities missing from the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Remove the canonical row. Snapshot history is kept.
    #[default]
    Hard,
    /// Keep the row with `deleted_at` set.
    Tombstone,
}

impl FromStr for DeletePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hard" => Ok(Self::Hard),
            "tombstone" | "soft" => Ok(Self::Tombstone),
            other => Err(format!("unknown delete policy `{other}` (expected hard|tombstone)")),
        }
    }
}

/// Deletion is only ever evaluated when `full_refresh` is explicitly set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    pub full_refresh: bool,
    pub row_failure: RowFailurePolicy,
    pub delete_policy: DeletePolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    pub inserted: usize,
    pub updated: usize,
    /// Rows rewritten with identical content (refresh timestamp only).
    pub unchanged: usize,
    pub deleted: usize,
    pub skipped: Vec<MergeRowError>,
    /// Rows whose stored representation changed, tombstones included.
    #[serde(skip)]
    pub written_ids: Vec<String>,
    #[serde(skip)]
    pub removed_ids: Vec<String>,
}

impl MergeResult {
    pub fn net_changes(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// In-memory image of the canonical relation keyed by entity identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalTable {
    rows: BTreeMap<String, CanonicalRow>,
}

impl CanonicalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = CanonicalRow>) -> Self {
        Self {
            rows: rows
                .into_iter()
                .map(|row| (row.entity_id.clone(), row))
                .collect(),
        }
    }

    pub fn get(&self, entity_id: &str) -> Option<&CanonicalRow> {
        self.rows.get(entity_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Every stored row, tombstones included, ordered by identifier.
    pub fn rows(&self) -> impl Iterator<Item = &CanonicalRow> {
        self.rows.values()
    }

    pub fn live_rows(&self) -> impl Iterator<Item = &CanonicalRow> {
        self.rows.values().filter(|row| row.is_live())
    }

    pub fn live_ids(&self) -> BTreeSet<String> {
        self.live_rows().map(|row| row.entity_id.clone()).collect()
    }
}

/// Enforce canonical column constraints on one transformed row.
pub fn check_row(row: &TransformedRow) -> Result<(), MergeRowError> {
    if row.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
        return Err(MergeRowError::new(&row.entity_id, MergeRowReason::MissingTitle));
    }
    if row.upload_ts.is_none() {
        return Err(MergeRowError::new(
            &row.entity_id,
            MergeRowReason::MissingUploadTimestamp,
        ));
    }
    let Metrics {
        views,
        likes,
        comments,
    } = row.metrics;
    for (metric, value) in [("views", views), ("likes", likes), ("comments", comments)] {
        if value.is_some_and(|v| i64::try_from(v).is_err()) {
            return Err(MergeRowError::new(
                &row.entity_id,
                MergeRowReason::MetricOutOfRange {
                    metric: metric.to_string(),
                },
            ));
        }
    }
    Ok(())
}

fn to_canonical(row: TransformedRow, now: DateTime<Utc>) -> Option<CanonicalRow> {
    Some(CanonicalRow {
        title: row.title?,
        upload_ts: row.upload_ts?,
        entity_id: row.entity_id,
        duration_seconds: row.duration_seconds,
        duration_interval: row.duration_interval,
        category: row.category,
        metrics: row.metrics,
        degraded: row.degraded,
        refreshed_at: now,
        deleted_at: None,
    })
}

/// Upsert `rows` into `canonical` and, for a full refresh only, retire live
/// entities missing from the batch.
///
/// With [`RowFailurePolicy::Abort`] the first failing row is returned and
/// `canonical` is left exactly as it was. Entities whose rows failed are never
/// treated as missing.
pub fn merge(
    canonical: &mut CanonicalTable,
    rows: Vec<TransformedRow>,
    options: &MergeOptions,
    now: DateTime<Utc>,
) -> Result<MergeResult, MergeRowError> {
    merge_with_rejected(canonical, rows, &BTreeSet::new(), options, now)
}

/// [`merge`] for a batch that also carried records rejected before this step.
///
/// `rejected` holds the identifiers of those records. They were in the batch,
/// so a full refresh keeps them even though no row arrives for them.
pub fn merge_with_rejected(
    canonical: &mut CanonicalTable,
    rows: Vec<TransformedRow>,
    rejected: &BTreeSet<String>,
    options: &MergeOptions,
    now: DateTime<Utc>,
) -> Result<MergeResult, MergeRowError> {
    let mut result = MergeResult::default();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut valid = Vec::with_capacity(rows.len());

    for row in rows {
        let first_sighting = seen.insert(row.entity_id.clone());
        let checked = if first_sighting {
            check_row(&row)
        } else {
            Err(MergeRowError::new(&row.entity_id, MergeRowReason::DuplicateEntity))
        };
        match checked {
            Ok(()) => valid.push(row),
            Err(err) if options.row_failure == RowFailurePolicy::Abort => return Err(err),
            Err(err) => {
                warn!(entity_id = %err.entity_id, reason = %err.reason, "merge row skipped");
                result.skipped.push(err);
            }
        }
    }

    for row in valid {
        let entity_id = row.entity_id.clone();
        let Some(incoming) = to_canonical(row, now) else {
            continue;
        };
        match canonical.rows.get_mut(&entity_id) {
            None => {
                debug!(%entity_id, "canonical insert");
                canonical.rows.insert(entity_id.clone(), incoming);
                result.inserted += 1;
            }
            Some(existing) if !existing.is_live() => {
                debug!(%entity_id, "canonical revive");
                *existing = incoming;
                result.inserted += 1;
            }
            Some(existing) => {
                if existing.same_content(&incoming) {
                    result.unchanged += 1;
                } else {
                    debug!(%entity_id, "canonical update");
                    result.updated += 1;
                }
                *existing = incoming;
            }
        }
        result.written_ids.push(entity_id);
    }

    if options.full_refresh {
        seen.extend(rejected.iter().cloned());
        let missing: Vec<String> = canonical
            .live_ids()
            .into_iter()
            .filter(|id| !seen.contains(id))
            .collect();
        for entity_id in missing {
            match options.delete_policy {
                DeletePolicy::Hard => {
                    canonical.rows.remove(&entity_id);
                    result.removed_ids.push(entity_id.clone());
                }
                DeletePolicy::Tombstone => {
                    if let Some(row) = canonical.rows.get_mut(&entity_id) {
                        row.deleted_at = Some(now);
                    }
                    result.written_ids.push(entity_id.clone());
                }
            }
            debug!(%entity_id, policy = ?options.delete_policy, "canonical delete");
            result.deleted += 1;
        }
    }

    Ok(result)
}
