//! Batch Applier - pushes deduplicated consent state to the record store.
//!
//! Walks a slice `[start, end)` of a [`DedupedSet`]. Each entry resolves to a
//! record key, gets its patch applied, and ends with exactly one
//! [`ApplyOutcome`]. A failed record never aborts the slice.
//!
//! The checkpoint is flushed every `flush_interval` processed records and
//! once more when the slice ends. Cancellation is only observed at those
//! flushes, so the stored position always matches work actually done.

use crate::cancel::CancellationToken;
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointKey, CheckpointStore};
use crate::config::{ApplyConfig, AttributeConfig};
use crate::governor::{call_governed, RateGovernor};
use crate::progress::ProgressTracker;
use crate::store::{AttributePatch, RecordKey, RecordStore};
use crate::types::{ApplyOutcome, DedupedEntry, DedupedSet, RunSummary};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Identities per lookup/update call. 1 selects the single-record calls.
    pub batch_size: usize,
    /// Processed records between checkpoint flushes.
    pub flush_interval: u64,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            flush_interval: 100,
        }
    }
}

impl From<&ApplyConfig> for ApplyOptions {
    fn from(config: &ApplyConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
        }
    }
}

/// Everything one apply pass produced.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub summary: RunSummary,
    /// Per-identity outcomes in processing order.
    pub outcomes: Vec<(String, ApplyOutcome)>,
    /// Stopped early at a flush boundary.
    pub cancelled: bool,
    pub checkpoint: Checkpoint,
}

pub struct BatchApplier<'a> {
    store: &'a dyn RecordStore,
    checkpoints: &'a dyn CheckpointStore,
    governor: &'a RateGovernor,
    attributes: &'a AttributeConfig,
    options: ApplyOptions,
    progress: Option<&'a ProgressTracker>,
    cancel: CancellationToken,
}

/// Counts accumulated since the last checkpoint flush.
#[derive(Default)]
struct Pending {
    records: u64,
    success: u64,
    errors: u64,
}

impl<'a> BatchApplier<'a> {
    pub fn new(
        store: &'a dyn RecordStore,
        checkpoints: &'a dyn CheckpointStore,
        governor: &'a RateGovernor,
        attributes: &'a AttributeConfig,
        options: ApplyOptions,
    ) -> Self {
        Self {
            store,
            checkpoints,
            governor,
            attributes,
            options,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: &'a ProgressTracker) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Effective batch size after capping at the store maximum.
    pub fn batch_size(&self) -> usize {
        self.options
            .batch_size
            .clamp(1, self.store.max_batch_size().max(1))
    }

    /// Apply `set[start..end)`. Only checkpoint persistence errors are fatal.
    pub async fn apply(
        &self,
        set: &DedupedSet,
        key: &CheckpointKey,
        start: u64,
        end: u64,
    ) -> Result<ApplyReport, CheckpointError> {
        let total = set.len() as u64;
        let end = end.min(total);
        let start = start.min(end);
        let batch_size = self.batch_size();
        let flush_interval = self.options.flush_interval.max(1);

        let mut checkpoint = self.checkpoints.load_or_default(key, total)?;
        checkpoint.total = total;
        checkpoint.position = checkpoint.position.min(total);

        info!(
            "Applying [{}, {}) of {} for {} (batch size {})",
            start, end, total, key, batch_size
        );

        let mut summary = RunSummary::starting_at(start);
        let mut outcomes = Vec::with_capacity((end - start) as usize);
        let mut pending = Pending::default();
        let mut cancelled = false;
        let mut position = start;

        while position < end {
            let chunk_end = (position + batch_size as u64).min(end);
            let entries = &set.entries()[position as usize..chunk_end as usize];

            let results = if batch_size == 1 {
                let mut single = Vec::with_capacity(entries.len());
                for entry in entries {
                    single.push(self.apply_one(entry).await);
                }
                single
            } else {
                self.apply_batch(entries).await
            };

            for (entry, outcome) in entries.iter().zip(results) {
                position += 1;
                info!("[{}/{}] {}: {}", position, total, entry.identity, outcome);
                summary.record(&entry.identity, &outcome);
                pending.records += 1;
                match outcome {
                    ApplyOutcome::Updated => pending.success += 1,
                    ApplyOutcome::Failed(_) => pending.errors += 1,
                    _ => {}
                }
                outcomes.push((entry.identity.clone(), outcome));
            }

            if let Some(progress) = self.progress {
                progress.set_position(position);
            }

            if pending.records >= flush_interval {
                self.flush(key, &mut checkpoint, position, &mut pending)?;
                if self.cancel.stop_at_flush(position) {
                    cancelled = true;
                    break;
                }
            }
        }

        if pending.records > 0 || checkpoint.position != position {
            self.flush(key, &mut checkpoint, position, &mut pending)?;
        }

        summary.next_identity = set.get(position as usize).map(|e| e.identity.clone());
        info!(
            "Apply finished at {}/{}: {} processed, {} updated, {} skipped, {} errors",
            position, total, summary.processed, summary.updated, summary.skipped, summary.errors
        );

        Ok(ApplyReport {
            summary,
            outcomes,
            cancelled,
            checkpoint,
        })
    }

    fn flush(
        &self,
        key: &CheckpointKey,
        checkpoint: &mut Checkpoint,
        position: u64,
        pending: &mut Pending,
    ) -> Result<(), CheckpointError> {
        checkpoint.advance(position, pending.success, pending.errors)?;
        self.checkpoints.save(key, checkpoint)?;
        debug!("Checkpoint flushed at {}/{}", position, checkpoint.total);
        *pending = Pending::default();
        Ok(())
    }

    async fn apply_one(&self, entry: &DedupedEntry) -> ApplyOutcome {
        let patch = AttributePatch::for_entry(entry, self.attributes);
        if patch.is_empty() {
            return ApplyOutcome::SkippedNoAttributes;
        }

        let store = self.store;
        let identity = entry.identity.as_str();
        let key = match call_governed(self.governor, move || store.lookup(identity)).await {
            Ok(Some(key)) => key,
            Ok(None) => return ApplyOutcome::SkippedNoRecord,
            Err(err) => return ApplyOutcome::Failed(format!("lookup failed: {}", err)),
        };
        self.update_single(&key, &patch).await
    }

    async fn update_single(&self, key: &RecordKey, patch: &AttributePatch) -> ApplyOutcome {
        let store = self.store;
        match call_governed(self.governor, move || store.update(key, patch)).await {
            Ok(()) => ApplyOutcome::Updated,
            Err(err) => ApplyOutcome::Failed(err.to_string()),
        }
    }

    /// One batched lookup and one batched update for the chunk, attributed
    /// back per entry. Outcomes come back in entry order.
    async fn apply_batch(&self, entries: &[DedupedEntry]) -> Vec<ApplyOutcome> {
        let mut outcomes: Vec<Option<ApplyOutcome>> = vec![None; entries.len()];
        let mut patches: Vec<Option<AttributePatch>> = Vec::with_capacity(entries.len());
        let mut identities = Vec::new();

        for (i, entry) in entries.iter().enumerate() {
            let patch = AttributePatch::for_entry(entry, self.attributes);
            if patch.is_empty() {
                outcomes[i] = Some(ApplyOutcome::SkippedNoAttributes);
                patches.push(None);
            } else {
                identities.push(entry.identity.clone());
                patches.push(Some(patch));
            }
        }

        if !identities.is_empty() {
            let store = self.store;
            let requested = identities.as_slice();
            match call_governed(self.governor, move || store.lookup_batch(requested)).await {
                Err(err) => {
                    let reason = format!("lookup failed: {}", err);
                    for (i, patch) in patches.iter().enumerate() {
                        if patch.is_some() {
                            outcomes[i] = Some(ApplyOutcome::Failed(reason.clone()));
                        }
                    }
                }
                Ok(found) => {
                    // Two identities may resolve to the same record; a batch may
                    // only carry each key once, so repeats are updated singly after.
                    let mut updates: Vec<(RecordKey, AttributePatch)> = Vec::new();
                    let mut batched: Vec<(usize, RecordKey)> = Vec::new();
                    let mut repeats: Vec<(usize, RecordKey)> = Vec::new();
                    let mut seen = HashSet::new();

                    for (i, entry) in entries.iter().enumerate() {
                        let Some(patch) = patches[i].take() else {
                            continue;
                        };
                        match found.get(&entry.identity) {
                            None => outcomes[i] = Some(ApplyOutcome::SkippedNoRecord),
                            Some(key) if seen.insert(key.clone()) => {
                                batched.push((i, key.clone()));
                                updates.push((key.clone(), patch));
                            }
                            Some(key) => {
                                repeats.push((i, key.clone()));
                                patches[i] = Some(patch);
                            }
                        }
                    }

                    if !updates.is_empty() {
                        let payload = updates.as_slice();
                        match call_governed(self.governor, move || store.update_batch(payload))
                            .await
                        {
                            Ok(report) => {
                                for (i, key) in &batched {
                                    outcomes[*i] = Some(report.outcome_for(key));
                                }
                            }
                            Err(err) => {
                                let reason = err.to_string();
                                for (i, _) in &batched {
                                    outcomes[*i] = Some(ApplyOutcome::Failed(reason.clone()));
                                }
                            }
                        }
                    }

                    for (i, key) in repeats {
                        if let Some(patch) = patches[i].take() {
                            outcomes[i] = Some(self.update_single(&key, &patch).await);
                        }
                    }
                }
            }
        }

        outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| ApplyOutcome::Failed("no outcome recorded".to_string())))
            .collect()
    }
}
