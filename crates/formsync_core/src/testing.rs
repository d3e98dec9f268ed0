//! In-memory doubles of the source, record store and checkpoint store.
//!
//! Used by unit tests here and by the integration tests under `tests/`.

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointKey, CheckpointStore};
use crate::config::{PacingConfig, SyncConfig};
use crate::governor::{Observed, RateFeedback};
use crate::source::{SourceError, SourcePage, SubmissionSource};
use crate::store::{AttributePatch, BatchUpdateReport, RecordKey, RecordStore, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pacing with every delay at zero.
pub fn unthrottled_pacing() -> PacingConfig {
    PacingConfig {
        min_delay_ms: 0,
        max_delay_ms: 0,
        default_delay_ms: 0,
        window_ms: 0,
        near_zero_remaining: 0,
        rate_limit_retries: 3,
        call_timeout_secs: 30,
    }
}

/// Default configuration with [`unthrottled_pacing`].
pub fn unthrottled_config() -> SyncConfig {
    SyncConfig {
        pacing: unthrottled_pacing(),
        ..Default::default()
    }
}

/// Serves scripted pages in order, ignoring the token it is sent.
pub struct MemorySource {
    pages: Vec<SourcePage>,
    max_page_size: usize,
    failure: Option<SourceError>,
    latency: Option<Duration>,
    feedback: Option<RateFeedback>,
    calls: Mutex<Vec<(Option<String>, usize)>>,
}

impl MemorySource {
    pub fn new(pages: Vec<SourcePage>) -> Self {
        Self {
            pages,
            max_page_size: 50,
            failure: None,
            latency: None,
            feedback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_page_size(mut self, max: usize) -> Self {
        self.max_page_size = max;
        self
    }

    /// Return `error` for every fetch past the scripted pages.
    pub fn fail_after_pages(mut self, error: SourceError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_feedback(mut self, feedback: RateFeedback) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn requested_tokens(&self) -> Vec<Option<String>> {
        lock(&self.calls).iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn requested_page_sizes(&self) -> Vec<usize> {
        lock(&self.calls).iter().map(|(_, s)| *s).collect()
    }
}

#[async_trait]
impl SubmissionSource for MemorySource {
    fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    async fn fetch_page(
        &self,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<Observed<SourcePage>, SourceError> {
        let index = {
            let mut calls = lock(&self.calls);
            calls.push((token.map(str::to_string), page_size));
            calls.len() - 1
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match (self.pages.get(index), &self.failure) {
            (Some(page), _) => Ok(Observed::new(page.clone()).with_feedback(self.feedback)),
            (None, Some(error)) => Err(error.clone()),
            (None, None) => Ok(Observed::new(SourcePage::last(Vec::new()))),
        }
    }
}

struct StoreState {
    /// Lowercased identity → key.
    contacts: HashMap<String, RecordKey>,
    records: HashMap<RecordKey, BTreeMap<String, String>>,
    failing_updates: HashMap<RecordKey, String>,
    lookup_failure: Option<StoreError>,
    rate_limited: u32,
    retry_after: Duration,
    lookup_calls: usize,
    update_calls: usize,
    batch_update_calls: usize,
}

/// Record store backed by a map. Lookups ignore identity case.
///
/// Clones share state, so a test can keep a handle after passing the
/// store into an orchestrator.
#[derive(Clone)]
pub struct MemoryRecordStore {
    state: Arc<Mutex<StoreState>>,
    max_batch_size: usize,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                contacts: HashMap::new(),
                records: HashMap::new(),
                failing_updates: HashMap::new(),
                lookup_failure: None,
                rate_limited: 0,
                retry_after: Duration::ZERO,
                lookup_calls: 0,
                update_calls: 0,
                batch_update_calls: 0,
            })),
            max_batch_size: 100,
        }
    }

    pub fn with_record(self, identity: &str, key: &str) -> Self {
        {
            let mut state = lock(&self.state);
            let key = RecordKey::new(key);
            state.contacts.insert(identity.trim().to_lowercase(), key.clone());
            state.records.entry(key).or_default();
        }
        self
    }

    /// Updates of `key` are rejected with `reason`.
    pub fn fail_updates_for(self, key: &str, reason: &str) -> Self {
        lock(&self.state)
            .failing_updates
            .insert(RecordKey::new(key), reason.to_string());
        self
    }

    pub fn fail_lookups_with(self, error: StoreError) -> Self {
        lock(&self.state).lookup_failure = Some(error);
        self
    }

    /// The next `count` calls of any kind answer "too many requests".
    pub fn rate_limit_next(self, count: u32, retry_after: Duration) -> Self {
        {
            let mut state = lock(&self.state);
            state.rate_limited = count;
            state.retry_after = retry_after;
        }
        self
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    pub fn record_properties(&self, key: &str) -> Option<BTreeMap<String, String>> {
        lock(&self.state).records.get(&RecordKey::new(key)).cloned()
    }

    pub fn lookup_calls(&self) -> usize {
        lock(&self.state).lookup_calls
    }

    pub fn update_calls(&self) -> usize {
        lock(&self.state).update_calls
    }

    pub fn batch_update_calls(&self) -> usize {
        lock(&self.state).batch_update_calls
    }

    fn throttle(state: &mut StoreState) -> Result<(), StoreError> {
        if state.rate_limited > 0 {
            state.rate_limited -= 1;
            return Err(StoreError::RateLimited {
                retry_after: state.retry_after,
            });
        }
        Ok(())
    }

    fn write(state: &mut StoreState, key: &RecordKey, patch: &AttributePatch) -> Result<(), String> {
        if let Some(reason) = state.failing_updates.get(key) {
            return Err(reason.clone());
        }
        match state.records.get_mut(key) {
            Some(properties) => {
                properties.extend(patch.properties.clone());
                Ok(())
            }
            None => Err(format!("record {} does not exist", key)),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn lookup(&self, identity: &str) -> Result<Observed<Option<RecordKey>>, StoreError> {
        let mut state = lock(&self.state);
        Self::throttle(&mut state)?;
        state.lookup_calls += 1;
        if let Some(error) = &state.lookup_failure {
            return Err(error.clone());
        }
        let key = state.contacts.get(&identity.trim().to_lowercase()).cloned();
        Ok(Observed::new(key))
    }

    async fn lookup_batch(
        &self,
        identities: &[String],
    ) -> Result<Observed<HashMap<String, RecordKey>>, StoreError> {
        let mut state = lock(&self.state);
        Self::throttle(&mut state)?;
        state.lookup_calls += 1;
        if let Some(error) = &state.lookup_failure {
            return Err(error.clone());
        }
        let found = identities
            .iter()
            .filter_map(|identity| {
                state
                    .contacts
                    .get(&identity.trim().to_lowercase())
                    .map(|key| (identity.clone(), key.clone()))
            })
            .collect();
        Ok(Observed::new(found))
    }

    async fn update(
        &self,
        key: &RecordKey,
        patch: &AttributePatch,
    ) -> Result<Observed<()>, StoreError> {
        let mut state = lock(&self.state);
        Self::throttle(&mut state)?;
        state.update_calls += 1;
        Self::write(&mut state, key, patch)
            .map(Observed::new)
            .map_err(|message| StoreError::Rejected {
                status: 400,
                message,
            })
    }

    async fn update_batch(
        &self,
        updates: &[(RecordKey, AttributePatch)],
    ) -> Result<Observed<BatchUpdateReport>, StoreError> {
        let mut state = lock(&self.state);
        Self::throttle(&mut state)?;
        state.batch_update_calls += 1;
        let mut report = BatchUpdateReport::default();
        for (key, patch) in updates {
            match Self::write(&mut state, key, patch) {
                Ok(()) => {
                    report.succeeded.insert(key.clone());
                }
                Err(reason) => {
                    report.failed.insert(key.clone(), reason);
                }
            }
        }
        Ok(Observed::new(report))
    }
}

/// Checkpoint store held in memory, counting saves.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<CheckpointKey, Checkpoint>>,
    saves: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(self, key: CheckpointKey, checkpoint: Checkpoint) -> Self {
        lock(&self.checkpoints).insert(key, checkpoint);
        self
    }

    pub fn get(&self, key: &CheckpointKey) -> Option<Checkpoint> {
        lock(&self.checkpoints).get(key).cloned()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.get(key))
    }

    fn save(&self, key: &CheckpointKey, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if checkpoint.position > checkpoint.total {
            return Err(CheckpointError::OutOfRange {
                position: checkpoint.position,
                total: checkpoint.total,
            });
        }
        lock(&self.checkpoints).insert(key.clone(), checkpoint.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&self, key: &CheckpointKey) -> Result<bool, CheckpointError> {
        Ok(lock(&self.checkpoints).remove(key).is_some())
    }

    fn list(&self, job_id: &str) -> Result<Vec<(CheckpointKey, Checkpoint)>, CheckpointError> {
        Ok(lock(&self.checkpoints)
            .iter()
            .filter(|(key, _)| key.job_id == job_id)
            .map(|(key, checkpoint)| (key.clone(), checkpoint.clone()))
            .collect())
    }
}
