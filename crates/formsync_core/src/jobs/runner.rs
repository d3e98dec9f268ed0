//! Job Runner - background execution with a single-flight guard.
//!
//! # Lock Invariant (runs)
//!
//! The `runs` map is only held for O(1) insert/lookup/remove. It is never
//! held across an await or any I/O: `trigger` reserves the slot, releases
//! the lock, then writes the job record.
//!
//! # Liveness
//!
//! A slot is active while its run task is alive, tracked by a flag the task
//! clears when it ends (including on panic or abort). The `JoinHandle` is
//! only the way to collect the result, so a caller inside [`JobRunner::wait`]
//! never makes the job look idle.

use super::{
    HealthStatus, JobId, JobRecord, JobStore, SourceProvider, TriggerError, TriggerRequest,
    TriggerResponse,
};
use crate::cancel::CancellationToken;
use crate::config::ConfigError;
use crate::orchestrator::{Orchestrator, RunError, RunReport, RunRequest};
use crate::progress::{ProgressReport, ProgressTracker, RunProgress};
use crate::source::SubmissionSource;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Minimum spacing between job-record writes while a run only advances.
const RECORD_SAVE_INTERVAL: Duration = Duration::from_secs(1);

struct RunSlot {
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<RunReport, RunError>>>,
}

impl RunSlot {
    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Clears the slot's running flag when the run task ends, however it ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    orchestrator: Orchestrator,
    sources: Box<dyn SourceProvider>,
    jobs: JobStore,
    runs: Mutex<HashMap<JobId, RunSlot>>,
}

/// Triggers runs in the background and answers progress polls.
///
/// Cloning shares the same runner.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

impl JobRunner {
    pub fn new(
        orchestrator: Orchestrator,
        sources: impl SourceProvider + 'static,
        jobs: JobStore,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                sources: Box::new(sources),
                jobs,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<JobId, RunSlot>> {
        self.inner
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a run and return immediately. Must be called inside a Tokio runtime.
    ///
    /// Configuration problems are reported here, before any network call.
    /// A second trigger for a job whose run is still active is rejected.
    pub fn trigger(&self, request: TriggerRequest) -> Result<TriggerResponse, TriggerError> {
        let config = self.inner.orchestrator.config();
        let job_id = request
            .job_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| config.source.form_id.clone())
            .ok_or_else(|| ConfigError::MissingIdentifier("job id or form id".to_string()))?;
        config.validate()?;
        let source = self.inner.sources.source_for(&job_id)?;
        let job_id = JobId::new(job_id);
        let mode = request.mode;

        let progress = Arc::new(ProgressTracker::new());
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));
        {
            let mut runs = self.runs();
            if runs.get(&job_id).is_some_and(RunSlot::is_active) {
                warn!("Rejected trigger for {}: a run is already active", job_id);
                return Err(TriggerError::AlreadyRunning(job_id));
            }
            runs.insert(
                job_id.clone(),
                RunSlot {
                    progress: progress.clone(),
                    cancel: cancel.clone(),
                    running: running.clone(),
                    handle: None,
                },
            );
        }

        let record = JobRecord::started(job_id.clone(), mode);
        if let Err(err) = self.inner.jobs.save(&record) {
            self.runs().remove(&job_id);
            return Err(TriggerError::Persist(format!("{:#}", err)));
        }

        let handle = tokio::spawn(execute(
            self.inner.clone(),
            source,
            request.into_run_request(&job_id),
            progress,
            cancel,
            record,
            RunningGuard(running),
        ));
        if let Some(slot) = self.runs().get_mut(&job_id) {
            slot.handle = Some(handle);
        }

        info!("Started {} run for job {}", mode, job_id);
        Ok(TriggerResponse::started(job_id, mode))
    }

    /// Current progress. Falls back to the persisted record for jobs this
    /// runner has not executed.
    pub fn progress(&self, job_id: &JobId) -> Option<ProgressReport> {
        if let Some(slot) = self.runs().get(job_id) {
            return Some(slot.progress.snapshot().report());
        }
        match self.inner.jobs.load(job_id) {
            Ok(record) => record.and_then(|r| r.progress),
            Err(err) => {
                debug!("No readable job record for {}: {:#}", job_id, err);
                None
            }
        }
    }

    /// Watch progress of a run started by this runner.
    pub fn subscribe(&self, job_id: &JobId) -> Option<watch::Receiver<RunProgress>> {
        self.runs().get(job_id).map(|slot| slot.progress.subscribe())
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.runs().get(job_id).is_some_and(RunSlot::is_active)
    }

    /// Request a stop at the next checkpoint flush. False when nothing is running.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        match self.runs().get(job_id) {
            Some(slot) if slot.is_active() => {
                slot.cancel.cancel();
                info!("Sent cancel signal to job: {}", job_id);
                true
            }
            _ => {
                debug!("No active run for job: {}", job_id);
                false
            }
        }
    }

    /// Wait for the run of `job_id` to finish. `None` if no run is pending
    /// or another caller is already waiting for it.
    pub async fn wait(&self, job_id: &JobId) -> Option<Result<RunReport, RunError>> {
        let handle = self.runs().get_mut(job_id)?.handle.take()?;
        Some(match handle.await {
            Ok(result) => result,
            Err(err) => Err(RunError::Aborted(err.to_string())),
        })
    }

    pub fn record(&self, job_id: &JobId) -> anyhow::Result<Option<JobRecord>> {
        self.inner.jobs.load(job_id)
    }

    /// Constant-time liveness probe.
    pub fn health(&self) -> HealthStatus {
        HealthStatus::ok()
    }
}

async fn execute(
    inner: Arc<Inner>,
    source: Arc<dyn SubmissionSource>,
    request: RunRequest,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
    mut record: JobRecord,
    _running: RunningGuard,
) -> Result<RunReport, RunError> {
    let watcher = tokio::spawn(persist_progress(
        inner.clone(),
        record.clone(),
        progress.subscribe(),
    ));

    let result = inner
        .orchestrator
        .run(source.as_ref(), &request, &progress, cancel)
        .await;

    // The final record must not be overwritten by a late progress write.
    watcher.abort();
    let _ = watcher.await;

    record.finish(&result, &progress.snapshot());
    if let Err(err) = inner.jobs.save(&record) {
        warn!("Failed to persist final record for {}: {:#}", record.job_id, err);
    }
    result
}

async fn persist_progress(
    inner: Arc<Inner>,
    mut record: JobRecord,
    mut rx: watch::Receiver<RunProgress>,
) {
    let mut last_state = record.state;
    let mut last_saved = Instant::now();
    while rx.changed().await.is_ok() {
        let progress = rx.borrow_and_update().clone();
        if progress.status == last_state && last_saved.elapsed() < RECORD_SAVE_INTERVAL {
            continue;
        }
        record.update_progress(&progress);
        if let Err(err) = inner.jobs.save(&record) {
            debug!("Skipped progress write for {}: {:#}", record.job_id, err);
        }
        last_state = progress.status;
        last_saved = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::FileCheckpointStore;
    use crate::config::TrackedAttribute;
    use crate::orchestrator::RunState;
    use crate::source::SourcePage;
    use crate::testing::{unthrottled_config, MemoryRecordStore, MemorySource};
    use crate::types::RawEvent;
    use tempfile::TempDir;

    fn runner(temp: &TempDir, source: MemorySource, store: MemoryRecordStore) -> JobRunner {
        let mut config = unthrottled_config();
        config.paths.home = Some(temp.path().to_path_buf());
        config.attributes.tracked = vec![TrackedAttribute::new("terms")];
        let checkpoints =
            Arc::new(FileCheckpointStore::new(config.paths.checkpoints_dir()).unwrap());
        let jobs = JobStore::new(config.paths.jobs_dir()).unwrap();
        let orchestrator = Orchestrator::new(Arc::new(config), Arc::new(store), checkpoints);
        let source: Arc<dyn SubmissionSource> = Arc::new(source);
        JobRunner::new(
            orchestrator,
            move |_: &str| -> Result<Arc<dyn SubmissionSource>, ConfigError> { Ok(source.clone()) },
            jobs,
        )
    }

    fn page() -> SourcePage {
        SourcePage::last(vec![RawEvent::new(1)
            .with_value("email", "a@x.com")
            .with_value("terms", "Checked")])
    }

    #[tokio::test]
    async fn test_trigger_runs_in_background() {
        let temp = TempDir::new().unwrap();
        let store = MemoryRecordStore::new().with_record("a@x.com", "1");
        let runner = runner(&temp, MemorySource::new(vec![page()]), store);

        let response = runner.trigger(TriggerRequest::for_job("form-1")).unwrap();
        assert_eq!(response.status, "started");

        let report = runner.wait(&response.job_id).await.unwrap().unwrap();
        assert_eq!(report.summary.updated, 1);

        let progress = runner.progress(&response.job_id).unwrap();
        assert_eq!(progress.status, RunState::Complete);
        assert_eq!(progress.percent_complete, 100.0);

        let record = runner.record(&response.job_id).unwrap().unwrap();
        assert_eq!(record.state, RunState::Complete);
        assert!(record.report.is_some());
    }

    #[tokio::test]
    async fn test_second_trigger_is_rejected_while_active() {
        let temp = TempDir::new().unwrap();
        let source = MemorySource::new(vec![page()]).with_latency(Duration::from_millis(200));
        let runner = runner(&temp, source, MemoryRecordStore::new());

        let first = runner.trigger(TriggerRequest::for_job("form-1")).unwrap();
        let second = runner.trigger(TriggerRequest::for_job("form-1"));
        assert!(matches!(second, Err(TriggerError::AlreadyRunning(_))));

        runner.wait(&first.job_id).await.unwrap().unwrap();
        assert!(!runner.is_active(&first.job_id));
        assert!(runner.trigger(TriggerRequest::for_job("form-1")).is_ok());
    }

    #[tokio::test]
    async fn test_run_stays_active_while_someone_waits() {
        let temp = TempDir::new().unwrap();
        let source = MemorySource::new(vec![page()]).with_latency(Duration::from_millis(300));
        let runner = runner(&temp, source, MemoryRecordStore::new());

        let first = runner.trigger(TriggerRequest::for_job("form-1")).unwrap();
        let waiter = {
            let runner = runner.clone();
            let job_id = first.job_id.clone();
            tokio::spawn(async move { runner.wait(&job_id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(runner.is_active(&first.job_id));
        assert!(runner.cancel(&first.job_id));
        assert!(matches!(
            runner.trigger(TriggerRequest::for_job("form-1")),
            Err(TriggerError::AlreadyRunning(_))
        ));

        let result = waiter.await.unwrap();
        assert!(result.is_some());
        assert!(!runner.is_active(&first.job_id));
    }

    #[tokio::test]
    async fn test_missing_job_id_is_rejected_synchronously() {
        let temp = TempDir::new().unwrap();
        let runner = runner(&temp, MemorySource::new(Vec::new()), MemoryRecordStore::new());

        let err = runner.trigger(TriggerRequest::default()).unwrap_err();
        assert!(matches!(
            err,
            TriggerError::Config(ConfigError::MissingIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_health_is_ok() {
        let temp = TempDir::new().unwrap();
        let runner = runner(&temp, MemorySource::new(Vec::new()), MemoryRecordStore::new());
        assert_eq!(runner.health().status, "ok");
    }
}
