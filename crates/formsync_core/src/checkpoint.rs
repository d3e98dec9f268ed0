//! Checkpoint Store - durable apply cursor
//!
//! One checkpoint per (job, target set). The target set is the fingerprint
//! of the deduplicated identity sequence, so a position is never applied to
//! a different ordering than the one it was recorded against.
//!
//! # Storage Format
//!
//! ```text
//! <home>/checkpoints/
//! └── {job_id}/
//!     └── {target_set}.json   {position, total, success, errors, timestamp}
//! ```
//!
//! Files are replaced wholesale via temp file + rename.

use crate::paths::{atomic_write, sanitize_name};
use crate::types::DedupedSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt checkpoint {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint position {position} exceeds total {total}")]
    OutOfRange { position: u64, total: u64 },
}

/// Identifies the checkpoint of one job against one target set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub job_id: String,
    pub target_set: String,
}

impl CheckpointKey {
    pub fn new(job_id: impl Into<String>, target_set: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            target_set: target_set.into(),
        }
    }

    pub fn for_set(job_id: impl Into<String>, set: &DedupedSet) -> Self {
        Self::new(job_id, set.fingerprint())
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.target_set)
    }
}

/// Durable progress marker. Invariant: `position <= total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub position: u64,
    pub total: u64,
    #[serde(rename = "success")]
    pub success_count: u64,
    #[serde(rename = "errors")]
    pub error_count: u64,
    #[serde(rename = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(total: u64) -> Self {
        Self {
            position: 0,
            total,
            success_count: 0,
            error_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Move the cursor, adding this flush's counts.
    pub fn advance(
        &mut self,
        position: u64,
        success: u64,
        errors: u64,
    ) -> Result<(), CheckpointError> {
        if position > self.total {
            return Err(CheckpointError::OutOfRange {
                position,
                total: self.total,
            });
        }
        self.position = position;
        self.success_count += success;
        self.error_count += errors;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.position)
    }
}

/// Durable checkpoint persistence. Single writer per job.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Replace the stored checkpoint. Must be atomic for readers.
    fn save(&self, key: &CheckpointKey, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Operator-initiated removal. Returns false when nothing was stored.
    fn reset(&self, key: &CheckpointKey) -> Result<bool, CheckpointError>;

    /// Every checkpoint of a job, keyed by target set.
    fn list(&self, job_id: &str) -> Result<Vec<(CheckpointKey, Checkpoint)>, CheckpointError>;

    /// Load or start fresh at position 0.
    fn load_or_default(
        &self,
        key: &CheckpointKey,
        total: u64,
    ) -> Result<Checkpoint, CheckpointError> {
        Ok(self.load(key)?.unwrap_or_else(|| Checkpoint::new(total)))
    }
}

/// Where to start applying.
///
/// An anchor wins over the stored position and resumes right after the
/// anchor. An anchor missing from the set restarts at 0 with a warning
/// rather than failing, so a stale anchor never blocks recovery.
pub fn resolve_start(set: &DedupedSet, anchor: Option<&str>, checkpoint: &Checkpoint) -> u64 {
    let total = set.len() as u64;
    match anchor.map(str::trim).filter(|a| !a.is_empty()) {
        Some(anchor) => match set.position_of(anchor) {
            Some(index) => {
                info!("Starting after anchor {} (position {})", anchor, index + 1);
                (index as u64 + 1).min(total)
            }
            None => {
                warn!(
                    "Anchor {} not found in {} deduplicated entries, starting at 0",
                    anchor, total
                );
                0
            }
        },
        None => checkpoint.position.min(total),
    }
}

/// JSON-file checkpoint store.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: PathBuf) -> Result<Self, CheckpointError> {
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.dir.join(sanitize_name(job_id))
    }

    fn checkpoint_path(&self, key: &CheckpointKey) -> PathBuf {
        self.job_dir(&key.job_id)
            .join(format!("{}.json", sanitize_name(&key.target_set)))
    }

    fn read(path: &PathBuf) -> Result<Checkpoint, CheckpointError> {
        let json = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| CheckpointError::Corrupt {
            path: path.clone(),
            source,
        })
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.checkpoint_path(key);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn save(&self, key: &CheckpointKey, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if checkpoint.position > checkpoint.total {
            return Err(CheckpointError::OutOfRange {
                position: checkpoint.position,
                total: checkpoint.total,
            });
        }
        let path = self.checkpoint_path(key);
        let json = serde_json::to_string_pretty(checkpoint).map_err(|source| {
            CheckpointError::Corrupt {
                path: path.clone(),
                source,
            }
        })?;
        atomic_write(&path, json.as_bytes()).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(
            "Saved checkpoint {} at {}/{}",
            key, checkpoint.position, checkpoint.total
        );
        Ok(())
    }

    fn reset(&self, key: &CheckpointKey) -> Result<bool, CheckpointError> {
        let path = self.checkpoint_path(key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        info!("Reset checkpoint {}", key);
        Ok(true)
    }

    fn list(&self, job_id: &str) -> Result<Vec<(CheckpointKey, Checkpoint)>, CheckpointError> {
        let dir = self.job_dir(job_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut found = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| CheckpointError::Io {
                    path: dir.clone(),
                    source,
                })?
                .path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(target_set) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let checkpoint = Self::read(&path)?;
            found.push((CheckpointKey::new(job_id, target_set), checkpoint));
        }
        found.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
        Ok(found)
    }
}
