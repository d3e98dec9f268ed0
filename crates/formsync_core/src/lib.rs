//! Formsync Core - Submission Reconciliation Pipeline
//!
//! Reconciles form submissions from a paginated source against a rate-limited
//! record store, applying the latest consent state per identity.
//!
//! # Pipeline
//!
//! ```text
//! SubmissionSource ──► Paginator ──► normalize ──► dedupe ──► DedupedSet
//!                          │                                      │
//!                     RateGovernor ◄──────────┐          (optional CSV export)
//!                                             │                   │
//!                        CheckpointStore ◄── BatchApplier ◄───────┘
//!                                             │
//!                                        RecordStore
//! ```
//!
//! The [`Orchestrator`] drives one run through
//! `Idle → Fetching → Deduplicating → Applying → Complete`, and the
//! [`JobRunner`] executes runs in the background with a single-flight guard
//! per job id.

pub mod applier;
pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod dedupe;
pub mod export;
pub mod governor;
pub mod jobs;
pub mod normalize;
pub mod orchestrator;
pub mod paginator;
pub mod paths;
pub mod progress;
pub mod source;
pub mod store;
pub mod testing;
pub mod types;

pub use applier::{ApplyOptions, ApplyReport, BatchApplier};
pub use cancel::CancellationToken;
pub use checkpoint::{
    resolve_start, Checkpoint, CheckpointError, CheckpointKey, CheckpointStore,
    FileCheckpointStore,
};
pub use config::{
    ApplyConfig, AttributeConfig, ConfigError, PacingConfig, PathsConfig, SourceConfig,
    SyncConfig, TrackedAttribute,
};
pub use dedupe::dedupe;
pub use export::{ExportError, SnapshotReader, SnapshotWriter};
pub use governor::{call_governed, next_delay, Observed, OutboundError, RateFeedback, RateGovernor};
pub use jobs::{
    HealthStatus, JobId, JobRecord, JobRunner, JobStore, SourceProvider, TriggerError,
    TriggerRequest, TriggerResponse,
};
pub use normalize::{normalize, normalize_all};
pub use orchestrator::{Orchestrator, RunError, RunMode, RunReport, RunRequest, RunState};
pub use paginator::{PaginationError, PaginationHalt, Paginator};
pub use progress::{ProgressReport, ProgressTracker, RunProgress};
pub use source::{SourceError, SourcePage, SubmissionSource};
pub use store::{AttributePatch, BatchUpdateReport, RecordKey, RecordStore, StoreError};
pub use types::{
    ApplyOutcome, ConsentState, DedupedEntry, DedupedSet, NormalizedEvent, RawEvent, RunSummary,
};
