//! Row- and run-level failures shared by every warehouse stage.

use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

/// Why a raw record was kept out of staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MalformedReason {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("entity identifier is missing")]
    MissingEntityId,
    #[error("entity identifier is not a non-empty string")]
    InvalidEntityId,
    #[error("field `{field}` has unusable value {value}")]
    InvalidField { field: String, value: String },
}

/// A raw record that could not be staged. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("raw record #{position} rejected: {reason}")]
pub struct MalformedRecordError {
    pub position: usize,
    pub entity_id: Option<String>,
    pub reason: MalformedReason,
}

impl MalformedRecordError {
    pub fn new(position: usize, reason: MalformedReason) -> Self {
        Self {
            position,
            entity_id: None,
            reason,
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeRowReason {
    #[error("title is required")]
    MissingTitle,
    #[error("upload timestamp is required")]
    MissingUploadTimestamp,
    #[error("metric `{metric}` exceeds the storable range")]
    MetricOutOfRange { metric: String },
    #[error("entity appears more than once in the batch")]
    DuplicateEntity,
}

/// A transformed row the canonical relation refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("merge failed for entity {entity_id}: {reason}")]
pub struct MergeRowError {
    pub entity_id: String,
    pub reason: MergeRowReason,
}

impl MergeRowError {
    pub fn new(entity_id: impl Into<String>, reason: MergeRowReason) -> Self {
        Self {
            entity_id: entity_id.into(),
            reason,
        }
    }
}

/// The logical date lies after the data it would record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error(
    "logical date {logical_date} is after the latest refresh ({refreshed_on}, entity {entity_id})"
)]
pub struct InvalidLogicalDateError {
    pub logical_date: NaiveDate,
    pub refreshed_on: NaiveDate,
    pub entity_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Staging,
    Canonical,
    Snapshot,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Staging => "staging",
            Relation::Canonical => "canonical",
            Relation::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Another run currently holds the target relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{relation} relation is locked by a concurrent run")]
pub struct RelationLockError {
    pub relation: Relation,
}

impl RelationLockError {
    #[inline]
    pub fn new(relation: Relation) -> Self {
        Self { relation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_record_names_position_and_reason() {
        let err = MalformedRecordError::new(3, MalformedReason::MissingEntityId);
        assert_eq!(
            err.to_string(),
            "raw record #3 rejected: entity identifier is missing"
        );
    }

    #[test]
    fn merge_row_error_carries_identifier() {
        let err = MergeRowError::new("dQw4w9WgXcQ", MergeRowReason::MissingTitle);
        assert!(err.to_string().contains("dQw4w9WgXcQ"));
        assert!(err.to_string().contains("title is required"));
    }

    #[test]
    fn lock_error_names_relation() {
        let err = RelationLockError::new(Relation::Snapshot);
        assert_eq!(err.to_string(), "snapshot relation is locked by a concurrent run");
    }
}
