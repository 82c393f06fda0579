//! Pure transformation rules applied between staging and the canonical merge.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use vwh_core::{DurationInterval, StagingRow, TransformedRow};

pub const CRATE_NAME: &str = "vwh-rules";

/// Layout version of `rules/categories.yaml` this crate reads.
pub const RULES_FILE_VERSION: u32 = 1;

const SECONDS_PER_WEEK: u64 = 604_800;
const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    #[error("duration is empty")]
    Empty,
    #[error("duration must start with 'P'")]
    MissingPrefix,
    #[error("duration has no components")]
    NoComponents,
    #[error("duration has an empty time part")]
    EmptyTimePart,
    #[error("designator '{0}' has no value")]
    MissingValue(char),
    #[error("calendar unit '{0}' has no fixed length")]
    CalendarUnit(char),
    #[error("unexpected character '{0}'")]
    Unexpected(char),
    #[error("designator '{0}' is repeated or out of order")]
    OutOfOrder(char),
    #[error("trailing digits without a designator")]
    TrailingDigits,
    #[error("duration overflows")]
    Overflow,
}

/// Parse an ISO-8601 duration (`P[nW][nD][T[nH][nM][nS]]`) into a normalised interval.
///
/// Years and months are rejected because their length depends on a calendar anchor.
pub fn parse_iso8601_duration(input: &str) -> Result<DurationInterval, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Empty);
    }
    let rest = trimmed
        .strip_prefix('P')
        .ok_or(DurationParseError::MissingPrefix)?;

    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };

    let mut components = 0usize;
    let mut total = parse_components(
        date_part,
        &[('W', SECONDS_PER_WEEK), ('D', SECONDS_PER_DAY)],
        &['Y', 'M'],
        &mut components,
    )?;

    if let Some(time) = time_part {
        if time.is_empty() {
            return Err(DurationParseError::EmptyTimePart);
        }
        let seconds = parse_components(
            time,
            &[('H', 3_600), ('M', 60), ('S', 1)],
            &[],
            &mut components,
        )?;
        total = total
            .checked_add(seconds)
            .ok_or(DurationParseError::Overflow)?;
    }

    if components == 0 {
        return Err(DurationParseError::NoComponents);
    }
    // Canonical storage is BIGINT.
    if i64::try_from(total).is_err() {
        return Err(DurationParseError::Overflow);
    }
    Ok(DurationInterval::from_total_seconds(total))
}

fn parse_components(
    part: &str,
    designators: &[(char, u64)],
    calendar_units: &[char],
    components: &mut usize,
) -> Result<u64, DurationParseError> {
    let mut total = 0u64;
    let mut next_allowed = 0usize;
    let mut digits = String::new();

    for c in part.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let Some(index) = designators.iter().position(|(d, _)| *d == c) else {
            if calendar_units.contains(&c) {
                return Err(DurationParseError::CalendarUnit(c));
            }
            return Err(DurationParseError::Unexpected(c));
        };
        if digits.is_empty() {
            return Err(DurationParseError::MissingValue(c));
        }
        if index < next_allowed {
            return Err(DurationParseError::OutOfOrder(c));
        }

        let value: u64 = digits.parse().map_err(|_| DurationParseError::Overflow)?;
        total = value
            .checked_mul(designators[index].1)
            .and_then(|v| total.checked_add(v))
            .ok_or(DurationParseError::Overflow)?;

        digits.clear();
        next_allowed = index + 1;
        *components += 1;
    }

    if !digits.is_empty() {
        return Err(DurationParseError::TrailingDigits);
    }
    Ok(total)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryThreshold {
    /// Inclusive upper bound in seconds.
    pub max_seconds: u64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("category label must not be empty")]
    EmptyLabel,
    #[error("threshold {0}s is declared more than once")]
    DuplicateThreshold(u64),
    #[error("unsupported category rules version {0} (expected {RULES_FILE_VERSION})")]
    UnsupportedVersion(u32),
}

/// Duration-to-label classification supplied at call time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryPolicy {
    thresholds: Vec<CategoryThreshold>,
    fallback: String,
}

impl Default for CategoryPolicy {
    fn default() -> Self {
        Self {
            thresholds: vec![CategoryThreshold {
                max_seconds: 60,
                label: "Shorts".to_string(),
            }],
            fallback: "Normal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRulesFile {
    version: u32,
    fallback: String,
    #[serde(default)]
    rules: Vec<CategoryThreshold>,
}

impl CategoryPolicy {
    pub fn new(
        mut thresholds: Vec<CategoryThreshold>,
        fallback: impl Into<String>,
    ) -> Result<Self, RuleError> {
        let fallback = fallback.into();
        if fallback.trim().is_empty() || thresholds.iter().any(|t| t.label.trim().is_empty()) {
            return Err(RuleError::EmptyLabel);
        }
        thresholds.sort_by_key(|t| t.max_seconds);
        if let Some(pair) = thresholds
            .windows(2)
            .find(|pair| pair[0].max_seconds == pair[1].max_seconds)
        {
            return Err(RuleError::DuplicateThreshold(pair[0].max_seconds));
        }
        Ok(Self {
            thresholds,
            fallback,
        })
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let file: CategoryRulesFile =
            serde_yaml::from_str(text).context("parsing category rules")?;
        if file.version != RULES_FILE_VERSION {
            return Err(RuleError::UnsupportedVersion(file.version).into());
        }
        Ok(Self::new(file.rules, file.fallback)?)
    }

    pub fn from_rules_dir(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join("categories.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn thresholds(&self) -> &[CategoryThreshold] {
        &self.thresholds
    }

    pub fn classify(&self, total_seconds: u64) -> &str {
        self.thresholds
            .iter()
            .find(|t| total_seconds <= t.max_seconds)
            .map(|t| t.label.as_str())
            .unwrap_or(self.fallback.as_str())
    }
}

/// Map one staging row to its canonical shape. Never fails: an unusable
/// duration leaves the duration columns empty and marks the row degraded.
pub fn transform_row(row: &StagingRow, policy: &CategoryPolicy) -> TransformedRow {
    let interval = match row.duration_raw.as_deref().map(parse_iso8601_duration) {
        Some(Ok(interval)) => Some(interval),
        Some(Err(err)) => {
            debug!(entity_id = %row.entity_id, %err, "duration unparseable, row degraded");
            None
        }
        None => None,
    };
    let duration_seconds = interval.map(|i| i.total_seconds());

    TransformedRow {
        entity_id: row.entity_id.clone(),
        title: row.title.clone(),
        upload_ts: row.upload_ts,
        duration_seconds,
        duration_interval: interval,
        category: duration_seconds.map(|secs| policy.classify(secs).to_string()),
        metrics: row.metrics,
        degraded: interval.is_none(),
    }
}

pub fn transform_batch(rows: &[StagingRow], policy: &CategoryPolicy) -> Vec<TransformedRow> {
    rows.iter().map(|row| transform_row(row, policy)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use vwh_core::Metrics;

    fn staging(duration: Option<&str>, metrics: Metrics) -> StagingRow {
        StagingRow {
            entity_id: "abc123".into(),
            title: Some("clip".into()),
            upload_ts: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single(),
            duration_raw: duration.map(str::to_string),
            metrics,
            ingested_at: Utc.with_ymd_and_hms(2026, 1, 27, 8, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn parses_common_api_durations() {
        assert_eq!(parse_iso8601_duration("PT33S").unwrap().total_seconds(), 33);
        assert_eq!(parse_iso8601_duration("PT15M33S").unwrap().total_seconds(), 933);
        assert_eq!(parse_iso8601_duration("P0D").unwrap().total_seconds(), 0);
        assert_eq!(
            parse_iso8601_duration("P1DT2H3M4S").unwrap(),
            DurationInterval {
                days: 1,
                hours: 2,
                minutes: 3,
                seconds: 4
            }
        );
        assert_eq!(
            parse_iso8601_duration("P1W").unwrap().total_seconds(),
            SECONDS_PER_WEEK
        );
    }

    #[test]
    fn normalises_overflowing_components() {
        let interval = parse_iso8601_duration("PT90M").unwrap();
        assert_eq!(interval.hours, 1);
        assert_eq!(interval.minutes, 30);
    }

    #[test]
    fn rejects_unusable_durations() {
        use DurationParseError::*;
        assert_eq!(parse_iso8601_duration(""), Err(Empty));
        assert_eq!(parse_iso8601_duration("NOT_A_DURATION"), Err(MissingPrefix));
        assert_eq!(parse_iso8601_duration("P"), Err(NoComponents));
        assert_eq!(parse_iso8601_duration("PT"), Err(EmptyTimePart));
        assert_eq!(parse_iso8601_duration("P1M"), Err(CalendarUnit('M')));
        assert_eq!(parse_iso8601_duration("P2Y"), Err(CalendarUnit('Y')));
        assert_eq!(parse_iso8601_duration("PT1.5S"), Err(Unexpected('.')));
        assert_eq!(parse_iso8601_duration("PT5S3M"), Err(OutOfOrder('M')));
        assert_eq!(parse_iso8601_duration("PTS"), Err(MissingValue('S')));
        assert_eq!(parse_iso8601_duration("PT12"), Err(TrailingDigits));
        assert_eq!(
            parse_iso8601_duration("PT99999999999999999999S"),
            Err(Overflow)
        );
    }

    #[test]
    fn default_policy_puts_sixty_seconds_in_shorts() {
        let policy = CategoryPolicy::default();
        assert_eq!(policy.classify(33), "Shorts");
        assert_eq!(policy.classify(60), "Shorts");
        assert_eq!(policy.classify(61), "Normal");
    }

    #[test]
    fn policy_thresholds_are_ordered_data() {
        let policy = CategoryPolicy::new(
            vec![
                CategoryThreshold {
                    max_seconds: 1_200,
                    label: "Medium".into(),
                },
                CategoryThreshold {
                    max_seconds: 60,
                    label: "Shorts".into(),
                },
            ],
            "Long",
        )
        .unwrap();
        assert_eq!(policy.classify(45), "Shorts");
        assert_eq!(policy.classify(600), "Medium");
        assert_eq!(policy.classify(3_600), "Long");
    }

    #[test]
    fn policy_rejects_duplicate_thresholds_and_blank_labels() {
        let dup = CategoryPolicy::new(
            vec![
                CategoryThreshold {
                    max_seconds: 60,
                    label: "A".into(),
                },
                CategoryThreshold {
                    max_seconds: 60,
                    label: "B".into(),
                },
            ],
            "C",
        );
        assert_eq!(dup, Err(RuleError::DuplicateThreshold(60)));
        assert_eq!(CategoryPolicy::new(vec![], " "), Err(RuleError::EmptyLabel));
    }

    #[test]
    fn policy_loads_from_rules_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("categories.yaml"),
            "version: 1\nfallback: Long\nrules:\n  - label: Clip\n    max_seconds: 30\n",
        )
        .expect("write rules");
        let policy = CategoryPolicy::from_rules_dir(dir.path()).expect("load");
        assert_eq!(policy.classify(30), "Clip");
        assert_eq!(policy.classify(31), "Long");
    }

    #[test]
    fn unknown_rules_version_is_rejected() {
        let err = CategoryPolicy::from_yaml_str("version: 2\nfallback: Normal\n").unwrap_err();
        assert_eq!(
            err.downcast_ref::<RuleError>(),
            Some(&RuleError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn transform_classifies_and_passes_metrics_through() {
        let metrics = Metrics {
            views: Some(10),
            likes: None,
            comments: Some(0),
        };
        let out = transform_row(&staging(Some("PT15M33S"), metrics), &CategoryPolicy::default());
        assert_eq!(out.duration_seconds, Some(933));
        assert_eq!(out.category.as_deref(), Some("Normal"));
        assert!(!out.degraded);
        assert_eq!(out.metrics.likes, None);
        assert_eq!(out.metrics.comments, Some(0));
    }

    #[test]
    fn unparseable_duration_degrades_instead_of_failing() {
        let out = transform_row(
            &staging(Some("NOT_A_DURATION"), Metrics::default()),
            &CategoryPolicy::default(),
        );
        assert!(out.degraded);
        assert_eq!(out.duration_interval, None);
        assert_eq!(out.duration_seconds, None);
        assert_eq!(out.category, None);
        assert_eq!(out.title.as_deref(), Some("clip"));

        let missing = transform_row(&staging(None, Metrics::default()), &CategoryPolicy::default());
        assert!(missing.degraded);
    }
}
