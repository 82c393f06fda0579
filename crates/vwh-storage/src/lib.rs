//! Immutable raw landing store for API batches.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;
use vwh_core::RawRecord;

pub const CRATE_NAME: &str = "vwh-storage";

const BATCH_EXT: &str = "json";
const MANIFEST_SUFFIX: &str = "manifest.json";

/// Stable pointer to one landed batch. Re-reading a handle always yields the
/// same records in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHandle {
    pub source_id: String,
    pub ingested_at: DateTime<Utc>,
    pub content_hash: String,
    pub relative_path: PathBuf,
}

impl fmt::Display for BatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative_path.display())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BatchManifest {
    source_id: String,
    ingested_at: DateTime<Utc>,
    content_hash: String,
    record_count: usize,
    batch_file: String,
}

#[derive(Debug, Clone)]
pub struct LandedBatch {
    pub handle: BatchHandle,
    pub absolute_path: PathBuf,
    pub record_count: usize,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Error)]
pub enum LandingError {
    #[error("source id {0:?} is not usable as a directory name")]
    InvalidSourceId(String),
    #[error("batch {path} does not contain a JSON array")]
    NotAnArray { path: String },
    #[error("batch {path} hash mismatch: expected {expected}, found {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

#[derive(Debug, Clone)]
pub struct LandingStore {
    root: PathBuf,
}

impl LandingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn batch_relative_path(
        &self,
        ingested_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = ingested_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(source_id)
            .join(format!("{content_hash}.{BATCH_EXT}"))
    }

    /// Land one API batch. Identical bytes for the same source and stamp are
    /// deduplicated onto the existing file.
    pub async fn put(
        &self,
        source_id: &str,
        records: &[JsonValue],
        ingested_at: DateTime<Utc>,
    ) -> anyhow::Result<LandedBatch> {
        validate_source_id(source_id)?;

        let bytes = serde_json::to_vec_pretty(records).context("serializing raw batch")?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = self.batch_relative_path(ingested_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = write_immutable(&absolute_path, &bytes).await?;

        let manifest = BatchManifest {
            source_id: source_id.to_string(),
            ingested_at,
            content_hash: content_hash.clone(),
            record_count: records.len(),
            batch_file: format!("{content_hash}.{BATCH_EXT}"),
        };
        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).context("serializing batch manifest")?;
        write_immutable(&manifest_path_for(&absolute_path), &manifest_bytes).await?;

        debug!(
            source_id,
            %content_hash,
            records = records.len(),
            deduplicated,
            path = %absolute_path.display(),
            "raw batch landed"
        );

        Ok(LandedBatch {
            handle: BatchHandle {
                source_id: source_id.to_string(),
                ingested_at,
                content_hash,
                relative_path,
            },
            absolute_path,
            record_count: records.len(),
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    /// Read every record of a landed batch, verifying the content hash first.
    pub async fn read_latest(&self, handle: &BatchHandle) -> anyhow::Result<Vec<RawRecord>> {
        let path = self.root.join(&handle.relative_path);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading raw batch {}", path.display()))?;

        let actual = Self::sha256_hex(&bytes);
        if actual != handle.content_hash {
            return Err(LandingError::HashMismatch {
                path: path.display().to_string(),
                expected: handle.content_hash.clone(),
                actual,
            }
            .into());
        }

        let value: JsonValue = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing raw batch {}", path.display()))?;
        let JsonValue::Array(items) = value else {
            return Err(LandingError::NotAnArray {
                path: path.display().to_string(),
            }
            .into());
        };

        Ok(items
            .into_iter()
            .enumerate()
            .map(|(position, payload)| RawRecord {
                position,
                ingested_at: handle.ingested_at,
                payload,
            })
            .collect())
    }

    /// Every batch landed for a source, oldest first.
    pub async fn list_handles(&self, source_id: &str) -> anyhow::Result<Vec<BatchHandle>> {
        validate_source_id(source_id)?;
        let mut handles = Vec::new();

        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking landing root {}", self.root.display()))?
        {
            return Ok(handles);
        }

        let mut stamps = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading landing root {}", self.root.display()))?;
        while let Some(stamp) = stamps.next_entry().await? {
            if !stamp.file_type().await?.is_dir() {
                continue;
            }
            let source_dir = stamp.path().join(source_id);
            if !fs::try_exists(&source_dir).await? {
                continue;
            }
            let mut files = fs::read_dir(&source_dir)
                .await
                .with_context(|| format!("reading {}", source_dir.display()))?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name().to_string_lossy().to_string();
                if !name.ends_with(&format!(".{MANIFEST_SUFFIX}")) {
                    continue;
                }
                handles.push(self.handle_from_manifest(&file.path()).await?);
            }
        }

        handles.sort_by(|a, b| {
            a.ingested_at
                .cmp(&b.ingested_at)
                .then_with(|| a.content_hash.cmp(&b.content_hash))
        });
        Ok(handles)
    }

    pub async fn latest_handle(&self, source_id: &str) -> anyhow::Result<Option<BatchHandle>> {
        Ok(self.list_handles(source_id).await?.pop())
    }

    /// Resolve a batch file path (absolute, or relative to the store root) to its handle.
    pub async fn open_handle(&self, batch_path: &Path) -> anyhow::Result<BatchHandle> {
        let absolute = if batch_path.is_absolute() {
            batch_path.to_path_buf()
        } else {
            self.root.join(batch_path)
        };
        self.handle_from_manifest(&manifest_path_for(&absolute))
            .await
    }

    async fn handle_from_manifest(&self, manifest_path: &Path) -> anyhow::Result<BatchHandle> {
        let text = fs::read_to_string(manifest_path)
            .await
            .with_context(|| format!("reading {}", manifest_path.display()))?;
        let manifest: BatchManifest = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", manifest_path.display()))?;
        Ok(BatchHandle {
            relative_path: self.batch_relative_path(
                manifest.ingested_at,
                &manifest.source_id,
                &manifest.content_hash,
            ),
            source_id: manifest.source_id,
            ingested_at: manifest.ingested_at,
            content_hash: manifest.content_hash,
        })
    }
}

fn validate_source_id(source_id: &str) -> Result<(), LandingError> {
    let usable = !source_id.is_empty()
        && source_id != "."
        && source_id != ".."
        && !source_id.contains(['/', '\\']);
    if usable {
        Ok(())
    } else {
        Err(LandingError::InvalidSourceId(source_id.to_string()))
    }
}

fn manifest_path_for(batch_path: &Path) -> PathBuf {
    batch_path.with_extension(MANIFEST_SUFFIX)
}

/// Write bytes through a temp file and atomic rename. Returns `true` when the
/// target already existed and nothing was written.
async fn write_immutable(absolute_path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = absolute_path
        .parent()
        .with_context(|| format!("{} has no parent directory", absolute_path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating landing directory {}", parent.display()))?;

    if fs::try_exists(absolute_path)
        .await
        .with_context(|| format!("checking landing path {}", absolute_path.display()))?
    {
        return Ok(true);
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, absolute_path).await {
        Ok(()) => Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(true)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            })
        }
    }
}
