//! Raw records to one typed staging row per entity.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};
use vwh_core::{Clock, MalformedReason, MalformedRecordError, Metrics, RawRecord, StagingRow};

pub const FIELD_ENTITY_ID: &str = "video_id";
pub const FIELD_TITLE: &str = "title";
pub const FIELD_UPLOAD_TS: &str = "publishedAt";
pub const FIELD_DURATION: &str = "duration";
pub const FIELD_VIEWS: &str = "viewCount";
pub const FIELD_LIKES: &str = "likeCount";
pub const FIELD_COMMENTS: &str = "commentCount";

#[derive(Debug, Clone, Serialize)]
pub struct StagingOutcome {
    pub loaded_at: DateTime<Utc>,
    pub raw_records: usize,
    /// Older duplicates that lost to a newer record for the same entity.
    pub superseded: usize,
    pub rows: Vec<StagingRow>,
    pub malformed: Vec<MalformedRecordError>,
}

pub struct StagingLoader {
    clock: Arc<dyn Clock>,
}

impl StagingLoader {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Build the full staging content for one batch. Bad records are reported
    /// in the outcome and never abort the load.
    pub fn load(&self, records: impl IntoIterator<Item = RawRecord>) -> StagingOutcome {
        let mut latest: BTreeMap<String, StagingRow> = BTreeMap::new();
        let mut malformed = Vec::new();
        let mut raw_records = 0usize;
        let mut superseded = 0usize;

        for record in records {
            raw_records += 1;
            match stage_record(&record) {
                Ok(row) => match latest.get(&row.entity_id) {
                    // Input order breaks ties: the later record wins.
                    Some(existing) if existing.ingested_at > row.ingested_at => {
                        superseded += 1;
                    }
                    Some(_) => {
                        superseded += 1;
                        latest.insert(row.entity_id.clone(), row);
                    }
                    None => {
                        latest.insert(row.entity_id.clone(), row);
                    }
                },
                Err(err) => {
                    warn!(
                        position = err.position,
                        entity_id = ?err.entity_id,
                        reason = %err.reason,
                        "raw record skipped"
                    );
                    malformed.push(err);
                }
            }
        }

        let outcome = StagingOutcome {
            loaded_at: self.clock.now(),
            raw_records,
            superseded,
            rows: latest.into_values().collect(),
            malformed,
        };
        debug!(
            raw = outcome.raw_records,
            staged = outcome.rows.len(),
            superseded = outcome.superseded,
            malformed = outcome.malformed.len(),
            "staging batch built"
        );
        outcome
    }
}

impl StagingOutcome {
    /// Identifiers of entities whose records were rejected and that have no
    /// valid record elsewhere in the batch.
    pub fn rejected_ids(&self) -> BTreeSet<String> {
        let staged: BTreeSet<&str> = self.rows.iter().map(|row| row.entity_id.as_str()).collect();
        self.malformed
            .iter()
            .filter_map(|err| err.entity_id.as_deref())
            .filter(|id| !staged.contains(id))
            .map(str::to_string)
            .collect()
    }
}

/// Type one raw record. Only the entity identifier is required; other fields
/// may be absent but must be coercible when present.
pub fn stage_record(record: &RawRecord) -> Result<StagingRow, MalformedRecordError> {
    let position = record.position;
    let JsonValue::Object(fields) = &record.payload else {
        return Err(MalformedRecordError::new(position, MalformedReason::NotAnObject));
    };

    let entity_id = match fields.get(FIELD_ENTITY_ID) {
        None | Some(JsonValue::Null) => {
            return Err(MalformedRecordError::new(
                position,
                MalformedReason::MissingEntityId,
            ))
        }
        Some(JsonValue::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
        Some(_) => {
            return Err(MalformedRecordError::new(
                position,
                MalformedReason::InvalidEntityId,
            ))
        }
    };

    let with_entity = |reason: MalformedReason| {
        MalformedRecordError::new(position, reason).with_entity(entity_id.clone())
    };

    let title = optional_string(fields, FIELD_TITLE).map_err(with_entity)?;
    let duration_raw = optional_string(fields, FIELD_DURATION).map_err(with_entity)?;
    let upload_ts = match optional_string(fields, FIELD_UPLOAD_TS).map_err(with_entity)? {
        Some(text) => Some(
            DateTime::parse_from_rfc3339(text.trim())
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| {
                    with_entity(invalid_field(FIELD_UPLOAD_TS, &JsonValue::String(text.clone())))
                })?,
        ),
        None => None,
    };
    let metrics = Metrics {
        views: optional_count(fields, FIELD_VIEWS).map_err(with_entity)?,
        likes: optional_count(fields, FIELD_LIKES).map_err(with_entity)?,
        comments: optional_count(fields, FIELD_COMMENTS).map_err(with_entity)?,
    };

    Ok(StagingRow {
        entity_id,
        title,
        upload_ts,
        duration_raw,
        metrics,
        ingested_at: record.ingested_at,
    })
}

fn invalid_field(field: &str, value: &JsonValue) -> MalformedReason {
    MalformedReason::InvalidField {
        field: field.to_string(),
        value: value.to_string(),
    }
}

fn optional_string(
    fields: &Map<String, JsonValue>,
    field: &str,
) -> Result<Option<String>, MalformedReason> {
    match fields.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(text)) => Ok(Some(text.clone())),
        Some(other) => Err(invalid_field(field, other)),
    }
}

/// Counts arrive as JSON strings from the content API, sometimes as numbers.
/// Anything negative or beyond the warehouse's BIGINT columns is rejected.
fn optional_count(
    fields: &Map<String, JsonValue>,
    field: &str,
) -> Result<Option<u64>, MalformedReason> {
    let value = match fields.get(field) {
        None | Some(JsonValue::Null) => return Ok(None),
        Some(JsonValue::String(text)) => text.trim().parse::<u64>().ok(),
        Some(JsonValue::Number(n)) => n.as_u64(),
        Some(other) => return Err(invalid_field(field, other)),
    };
    match value {
        Some(count) if i64::try_from(count).is_ok() => Ok(Some(count)),
        _ => Err(invalid_field(field, &fields[field])),
    }
}
