//! Run Orchestrator - one reconciliation run end to end.
//!
//! ```text
//! Idle → Fetching → Deduplicating → Applying → Complete
//!            │            │             │
//!            └────────────┴─────────────┴──► Error
//! ```
//!
//! Every event is deduplicated before the first apply decision. A failure
//! in any stage moves the run to `Error` and leaves the checkpoint at its
//! last flushed value.

use crate::applier::{ApplyOptions, BatchApplier};
use crate::cancel::CancellationToken;
use crate::checkpoint::{resolve_start, CheckpointError, CheckpointKey, CheckpointStore};
use crate::config::{ConfigError, SyncConfig};
use crate::dedupe::dedupe;
use crate::export::{ExportError, SnapshotReader, SnapshotWriter};
use crate::governor::RateGovernor;
use crate::normalize::normalize_all;
use crate::paginator::{PaginationError, Paginator};
use crate::progress::ProgressTracker;
use crate::source::SubmissionSource;
use crate::store::RecordStore;
use crate::types::{DedupedSet, RunSummary};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Deduplicating,
    Applying,
    Complete,
    Error,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Deduplicating => "deduplicating",
            Self::Applying => "applying",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a run does after deduplication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Fetch, deduplicate and export. No record updates.
    Prep,
    /// Deduplicate (fresh fetch or snapshot) and apply.
    #[default]
    Apply,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prep => write!(f, "prep"),
            Self::Apply => write!(f, "apply"),
        }
    }
}

/// Parameters of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub job_id: String,
    pub mode: RunMode,
    /// Identity after which to resume, overriding the checkpoint.
    pub start_anchor: Option<String>,
    /// Maximum records to process in this run.
    pub limit: Option<u64>,
    pub batch_size: Option<usize>,
    /// Load the deduplicated set from a previous export instead of fetching.
    pub snapshot: Option<PathBuf>,
    /// Where to write the export. Prep runs fall back to the configured path.
    pub export: Option<PathBuf>,
}

impl RunRequest {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_anchor(mut self, anchor: impl Into<String>) -> Self {
        self.start_anchor = Some(anchor.into());
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot = Some(path.into());
        self
    }

    pub fn with_export(mut self, path: impl Into<PathBuf>) -> Self {
        self.export = Some(path.into());
        self
    }
}

/// Result of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub job_id: String,
    pub mode: RunMode,
    pub state: RunState,
    /// Fingerprint of the deduplicated set the checkpoint refers to.
    pub target_set: String,
    /// Raw events fetched (0 when loaded from a snapshot).
    pub fetched: u64,
    /// Fetched events dropped for lacking an identity.
    pub unusable: u64,
    pub deduplicated: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_path: Option<PathBuf>,
    pub summary: RunSummary,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Pagination halted after {fetched} events: {source}")]
    Pagination {
        fetched: usize,
        #[source]
        source: PaginationError,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Run aborted: {0}")]
    Aborted(String),
}

/// Composes paginator, normalizer, deduplicator, export and applier.
pub struct Orchestrator {
    config: Arc<SyncConfig>,
    store: Arc<dyn RecordStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    governor: Arc<RateGovernor>,
}

impl Orchestrator {
    /// The governor is built from the pacing config and shared by every
    /// call this orchestrator makes.
    pub fn new(
        config: Arc<SyncConfig>,
        store: Arc<dyn RecordStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let governor = Arc::new(RateGovernor::new(config.pacing.clone()));
        Self::with_governor(config, store, checkpoints, governor)
    }

    pub fn with_governor(
        config: Arc<SyncConfig>,
        store: Arc<dyn RecordStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        governor: Arc<RateGovernor>,
    ) -> Self {
        Self {
            config,
            store,
            checkpoints,
            governor,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &dyn CheckpointStore {
        self.checkpoints.as_ref()
    }

    /// Execute one run, reporting through `progress`.
    pub async fn run(
        &self,
        source: &dyn SubmissionSource,
        request: &RunRequest,
        progress: &ProgressTracker,
        cancel: CancellationToken,
    ) -> Result<RunReport, RunError> {
        match self.execute(source, request, progress, cancel).await {
            Ok(report) => {
                progress.transition(report.state);
                info!(
                    job_id = %request.job_id,
                    "Run {}: {} processed, {} updated, {} skipped, {} errors",
                    report.state,
                    report.summary.processed,
                    report.summary.updated,
                    report.summary.skipped,
                    report.summary.errors
                );
                Ok(report)
            }
            Err(err) => {
                error!(job_id = %request.job_id, "Run failed: {}", err);
                progress.fail(err.to_string());
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        source: &dyn SubmissionSource,
        request: &RunRequest,
        progress: &ProgressTracker,
        cancel: CancellationToken,
    ) -> Result<RunReport, RunError> {
        self.config.validate()?;
        let attributes = &self.config.attributes;

        let (set, fetched, unusable) = match &request.snapshot {
            Some(path) => {
                progress.transition(RunState::Deduplicating);
                let set = SnapshotReader::new(attributes).read(path)?;
                (set, 0, 0)
            }
            None => self.fetch_and_dedupe(source, progress).await?,
        };

        let total = set.len() as u64;
        let target_set = set.fingerprint();
        progress.set_total(total);
        info!(
            job_id = %request.job_id,
            "Deduplicated {} fetched events into {} identities (set {})",
            fetched, total, target_set
        );

        let export_path = match (&request.export, request.mode) {
            (Some(path), _) => Some(path.clone()),
            (None, RunMode::Prep) => Some(self.config.paths.export_path_for(&request.job_id)),
            (None, RunMode::Apply) => None,
        };
        if let Some(path) = &export_path {
            SnapshotWriter::new(attributes).write(&set, path)?;
        }

        let mut report = RunReport {
            job_id: request.job_id.clone(),
            mode: request.mode,
            state: RunState::Complete,
            target_set,
            fetched,
            unusable,
            deduplicated: total,
            export_path,
            summary: RunSummary::default(),
        };

        if request.mode == RunMode::Prep {
            return Ok(report);
        }

        progress.transition(RunState::Applying);
        let (summary, cancelled) = self.apply(&set, request, progress, cancel).await?;
        report.summary = summary;
        if cancelled {
            report.state = RunState::Cancelled;
        }
        Ok(report)
    }

    async fn fetch_and_dedupe(
        &self,
        source: &dyn SubmissionSource,
        progress: &ProgressTracker,
    ) -> Result<(DedupedSet, u64, u64), RunError> {
        progress.transition(RunState::Fetching);
        let mut paginator = Paginator::new(source, &self.governor, &self.config.source);
        let mut raw = Vec::new();
        loop {
            match paginator.next_page().await {
                Ok(Some(page)) => {
                    progress.add_fetched(page.len() as u64);
                    raw.extend(page);
                }
                Ok(None) => break,
                Err(source) => {
                    return Err(RunError::Pagination {
                        fetched: raw.len(),
                        source,
                    })
                }
            }
        }

        progress.transition(RunState::Deduplicating);
        let (usable, unusable) = normalize_all(&raw, &self.config.attributes);
        if unusable > 0 {
            warn!("{} submissions had no identity and were dropped", unusable);
        }
        Ok((dedupe(usable), raw.len() as u64, unusable as u64))
    }

    async fn apply(
        &self,
        set: &DedupedSet,
        request: &RunRequest,
        progress: &ProgressTracker,
        cancel: CancellationToken,
    ) -> Result<(RunSummary, bool), RunError> {
        let total = set.len() as u64;
        let key = CheckpointKey::for_set(request.job_id.as_str(), set);
        let checkpoint = self.checkpoints.load_or_default(&key, total)?;
        let start = resolve_start(set, request.start_anchor.as_deref(), &checkpoint);
        let end = match request.limit.or(self.config.apply.default_limit) {
            Some(limit) => start.saturating_add(limit).min(total),
            None => total,
        };
        progress.set_position(start);

        let mut options = ApplyOptions::from(&self.config.apply);
        if let Some(batch_size) = request.batch_size {
            options.batch_size = batch_size.max(1);
        }

        let report = BatchApplier::new(
            self.store.as_ref(),
            self.checkpoints.as_ref(),
            &self.governor,
            &self.config.attributes,
            options,
        )
        .with_progress(progress)
        .with_cancellation(cancel)
        .apply(set, &key, start, end)
        .await?;

        Ok((report.summary, report.cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackedAttribute;
    use crate::source::{SourceError, SourcePage};
    use crate::testing::{
        unthrottled_config, MemoryCheckpointStore, MemoryRecordStore, MemorySource,
    };
    use crate::types::RawEvent;

    fn event(email: &str, ts: i64, terms: &str) -> RawEvent {
        RawEvent::new(ts)
            .with_value("email", email)
            .with_value("terms", terms)
    }

    fn orchestrator(store: MemoryRecordStore) -> (Orchestrator, Arc<MemoryCheckpointStore>) {
        let mut config = unthrottled_config();
        config.attributes.tracked = vec![TrackedAttribute::new("terms")];
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let orchestrator =
            Orchestrator::new(Arc::new(config), Arc::new(store), checkpoints.clone());
        (orchestrator, checkpoints)
    }

    #[tokio::test]
    async fn test_latest_event_wins_end_to_end() {
        let source = MemorySource::new(vec![SourcePage::last(vec![
            event("a@x.com", 1, "Not Checked"),
            event("b@x.com", 5, "Checked"),
            event("a@x.com", 9, "Checked"),
        ])]);
        let store = MemoryRecordStore::new().with_record("a@x.com", "1");
        let (orchestrator, _) = orchestrator(store.clone());
        let progress = ProgressTracker::new();

        let report = orchestrator
            .run(&source, &RunRequest::new("form"), &progress, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.deduplicated, 2);
        assert_eq!(report.summary.processed, 2);
        assert_eq!(report.summary.updated, 1);
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.summary.errors, 0);
        assert_eq!(store.record_properties("1").unwrap()["terms"], "Checked");
        assert_eq!(progress.snapshot().status, RunState::Complete);
    }

    #[tokio::test]
    async fn test_pagination_failure_moves_to_error() {
        let source = MemorySource::new(vec![SourcePage::with_next(
            vec![event("a@x.com", 1, "Checked")],
            "t1",
        )])
        .fail_after_pages(SourceError::Timeout(std::time::Duration::from_secs(30)));
        let (orchestrator, checkpoints) = orchestrator(MemoryRecordStore::new());
        let progress = ProgressTracker::new();

        let err = orchestrator
            .run(&source, &RunRequest::new("form"), &progress, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Pagination { fetched: 1, .. }));
        assert_eq!(progress.snapshot().status, RunState::Error);
        assert_eq!(checkpoints.save_count(), 0);
    }

    #[tokio::test]
    async fn test_prep_mode_exports_without_updates() {
        let temp = tempfile::TempDir::new().unwrap();
        let export = temp.path().join("out.csv");
        let source = MemorySource::new(vec![SourcePage::last(vec![event("a@x.com", 1, "Checked")])]);
        let store = MemoryRecordStore::new().with_record("a@x.com", "1");
        let (orchestrator, _) = orchestrator(store.clone());

        let request = RunRequest::new("form")
            .with_mode(RunMode::Prep)
            .with_export(&export);
        let report = orchestrator
            .run(&source, &request, &ProgressTracker::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.summary.processed, 0);
        assert_eq!(report.export_path.as_deref(), Some(export.as_path()));
        assert!(export.exists());
        assert_eq!(store.update_calls(), 0);
    }

    #[tokio::test]
    async fn test_apply_from_snapshot_skips_fetch() {
        let temp = tempfile::TempDir::new().unwrap();
        let snapshot = temp.path().join("snapshot.csv");
        std::fs::write(&snapshot, "email,terms\na@x.com,Checked\n").unwrap();
        let source = MemorySource::new(Vec::new());
        let store = MemoryRecordStore::new().with_record("a@x.com", "1");
        let (orchestrator, _) = orchestrator(store.clone());

        let request = RunRequest::new("form").with_snapshot(&snapshot);
        let report = orchestrator
            .run(&source, &request, &ProgressTracker::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.fetched, 0);
        assert_eq!(report.summary.updated, 1);
        assert!(source.requested_tokens().is_empty());
    }
}
