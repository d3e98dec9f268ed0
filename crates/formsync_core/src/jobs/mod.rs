//! Job Subsystem
//!
//! Background execution of reconciliation runs:
//! - Trigger returns immediately, the run executes on a spawned task
//! - Progress is polled, never pushed through the trigger response
//! - One active run per job id (single-flight)
//! - Cooperative cancellation at checkpoint-flush boundaries
//! - A JSON job record per job id, readable from other processes
//!
//! A job id is the form id the run reconciles.

mod runner;
mod store;

pub use runner::JobRunner;
pub use store::JobStore;

use crate::config::ConfigError;
use crate::orchestrator::{RunError, RunMode, RunReport, RunRequest, RunState};
use crate::progress::{ProgressReport, RunProgress};
use crate::source::SubmissionSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Job identifier (the form id being reconciled).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Request to start a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Job or form id. Falls back to the configured form id.
    #[serde(default, alias = "form_id")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub start_anchor: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
    #[serde(default)]
    pub export: Option<PathBuf>,
}

impl TriggerRequest {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    fn into_run_request(self, job_id: &JobId) -> RunRequest {
        RunRequest {
            job_id: job_id.to_string(),
            mode: self.mode,
            start_anchor: self.start_anchor,
            limit: self.limit,
            batch_size: self.batch_size,
            snapshot: self.snapshot,
            export: self.export,
        }
    }
}

/// Immediate answer to a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub status: String,
    pub mode: RunMode,
    pub job_id: JobId,
}

impl TriggerResponse {
    fn started(job_id: JobId, mode: RunMode) -> Self {
        Self {
            status: "started".to_string(),
            mode,
            job_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("A run is already active for job {0}")]
    AlreadyRunning(JobId),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to persist job record: {0}")]
    Persist(String),
}

/// Liveness probe response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
}

impl HealthStatus {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Builds the submission source for a job id.
pub trait SourceProvider: Send + Sync {
    fn source_for(&self, job_id: &str) -> Result<Arc<dyn SubmissionSource>, ConfigError>;
}

impl<F> SourceProvider for F
where
    F: Fn(&str) -> Result<Arc<dyn SubmissionSource>, ConfigError> + Send + Sync,
{
    fn source_for(&self, job_id: &str) -> Result<Arc<dyn SubmissionSource>, ConfigError> {
        self(job_id)
    }
}

/// Persisted status of the latest run of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub mode: RunMode,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn started(job_id: JobId, mode: RunMode) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            mode,
            state: RunState::Idle,
            message: None,
            progress: None,
            report: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn update_progress(&mut self, progress: &RunProgress) {
        self.state = progress.status;
        self.message = progress.message.clone();
        self.progress = Some(progress.report());
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self, result: &Result<RunReport, RunError>, progress: &RunProgress) {
        self.update_progress(progress);
        match result {
            Ok(report) => {
                self.state = report.state;
                self.report = Some(report.clone());
            }
            Err(err) => {
                self.state = RunState::Error;
                self.message = Some(err.to_string());
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
