//! Core domain model for the video metrics warehouse.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

mod error;

pub use error::{
    InvalidLogicalDateError, MalformedReason, MalformedRecordError, MergeRowError,
    MergeRowReason, Relation, RelationLockError,
};

pub const CRATE_NAME: &str = "vwh-core";

/// One element of a landed batch, exactly as the content API returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Zero-based position inside the landed batch.
    pub position: usize,
    pub ingested_at: DateTime<Utc>,
    pub payload: JsonValue,
}

/// View/like/comment counts. `None` means the API omitted the metric, which is
/// not the same thing as a zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub views: Option<u64>,
    pub likes: Option<u64>,
    pub comments: Option<u64>,
}

/// A duration normalised to days/hours/minutes/seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationInterval {
    pub days: u64,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

impl DurationInterval {
    pub fn from_total_seconds(total: u64) -> Self {
        Self {
            days: total / 86_400,
            hours: ((total % 86_400) / 3_600) as u8,
            minutes: ((total % 3_600) / 60) as u8,
            seconds: (total % 60) as u8,
        }
    }

    pub fn total_seconds(&self) -> u64 {
        self.days * 86_400
            + u64::from(self.hours) * 3_600
            + u64::from(self.minutes) * 60
            + u64::from(self.seconds)
    }
}

/// Typed, untransformed projection of the latest raw record for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRow {
    pub entity_id: String,
    pub title: Option<String>,
    pub upload_ts: Option<DateTime<Utc>>,
    pub duration_raw: Option<String>,
    #[serde(flatten)]
    pub metrics: Metrics,
    pub ingested_at: DateTime<Utc>,
}

/// Canonical-shaped output of the transformation rules, before the merger
/// enforces canonical constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedRow {
    pub entity_id: String,
    pub title: Option<String>,
    pub upload_ts: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
    pub duration_interval: Option<DurationInterval>,
    pub category: Option<String>,
    #[serde(flatten)]
    pub metrics: Metrics,
    /// The duration could not be parsed; the row is kept with empty duration columns.
    pub degraded: bool,
}

/// Current state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub entity_id: String,
    pub title: String,
    pub upload_ts: DateTime<Utc>,
    pub duration_seconds: Option<u64>,
    pub duration_interval: Option<DurationInterval>,
    pub category: Option<String>,
    #[serde(flatten)]
    pub metrics: Metrics,
    pub degraded: bool,
    pub refreshed_at: DateTime<Utc>,
    /// Set when a full refresh retired the entity under the tombstone policy.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CanonicalRow {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Compares every business column, ignoring bookkeeping timestamps.
    pub fn same_content(&self, other: &CanonicalRow) -> bool {
        self.entity_id == other.entity_id
            && self.title == other.title
            && self.upload_ts == other.upload_ts
            && self.duration_seconds == other.duration_seconds
            && self.duration_interval == other.duration_interval
            && self.category == other.category
            && self.metrics == other.metrics
            && self.degraded == other.degraded
    }
}

/// Immutable metrics history for one entity on one logical date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub entity_id: String,
    pub snapshot_date: NaiveDate,
    #[serde(flatten)]
    pub metrics: Metrics,
    /// Refresh time of the canonical row the first snapshot for this date was
    /// taken from. Reruns of the date keep it.
    pub inserted_at: DateTime<Utc>,
}

/// Source of "now" for everything that stamps rows.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a single instant, for reproducible runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn interval_normalises_total_seconds() {
        let interval = DurationInterval::from_total_seconds(90_061);
        assert_eq!(
            interval,
            DurationInterval {
                days: 1,
                hours: 1,
                minutes: 1,
                seconds: 1
            }
        );
        assert_eq!(interval.total_seconds(), 90_061);
    }

    #[test]
    fn same_content_ignores_refresh_and_tombstone() {
        let at = Utc.with_ymd_and_hms(2026, 1, 27, 8, 0, 0).single().unwrap();
        let a = CanonicalRow {
            entity_id: "abc".into(),
            title: "t".into(),
            upload_ts: at,
            duration_seconds: Some(33),
            duration_interval: Some(DurationInterval::from_total_seconds(33)),
            category: Some("Shorts".into()),
            metrics: Metrics {
                views: Some(1),
                likes: None,
                comments: Some(0),
            },
            degraded: false,
            refreshed_at: at,
            deleted_at: None,
        };
        let mut b = a.clone();
        b.refreshed_at = at + chrono::Duration::hours(1);
        assert!(a.same_content(&b));

        b.metrics.likes = Some(0);
        assert!(!a.same_content(&b));
    }
}
