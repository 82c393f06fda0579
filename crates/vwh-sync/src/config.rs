use std::path::PathBuf;

use anyhow::{anyhow, Result};

use crate::merge::{DeletePolicy, MergeOptions, RowFailurePolicy};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` runs against the in-process warehouse.
    pub database_url: Option<String>,
    pub landing_dir: PathBuf,
    pub source_id: String,
    pub reports_dir: PathBuf,
    pub rules_dir: PathBuf,
    pub full_refresh: bool,
    pub delete_policy: DeletePolicy,
    pub row_failure: RowFailurePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            landing_dir: PathBuf::from("./landing"),
            source_id: "youtube".to_string(),
            reports_dir: PathBuf::from("./reports"),
            rules_dir: PathBuf::from("./rules"),
            full_refresh: false,
            delete_policy: DeletePolicy::default(),
            row_failure: RowFailurePolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let path = |key: &str, fallback: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(fallback);

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            landing_dir: path("VWH_LANDING_DIR", defaults.landing_dir),
            source_id: lookup("VWH_SOURCE_ID").unwrap_or(defaults.source_id),
            reports_dir: path("VWH_REPORTS_DIR", defaults.reports_dir),
            rules_dir: path("VWH_RULES_DIR", defaults.rules_dir),
            full_refresh: lookup("VWH_FULL_REFRESH")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            delete_policy: match lookup("VWH_DELETE_POLICY") {
                Some(v) => v.parse().map_err(|e: String| anyhow!(e))?,
                None => defaults.delete_policy,
            },
            row_failure: match lookup("VWH_ROW_FAILURE_POLICY") {
                Some(v) => v.parse().map_err(|e: String| anyhow!(e))?,
                None => defaults.row_failure,
            },
        })
    }

    pub fn merge_options(&self, full_refresh: bool) -> MergeOptions {
        MergeOptions {
            full_refresh: full_refresh || self.full_refresh,
            row_failure: self.row_failure,
            delete_policy: self.delete_policy,
        }
    }
}
