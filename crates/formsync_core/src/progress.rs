//! Run progress for external polling.

use crate::orchestrator::RunState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Live view of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub status: RunState,
    /// Position in the deduplicated set reached so far.
    pub position: u64,
    /// Deduplicated set size, known once deduplication finished.
    pub total: u64,
    /// Raw events fetched so far.
    pub fetched: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self {
            status: RunState::Idle,
            position: 0,
            total: 0,
            fetched: 0,
            message: None,
            updated_at: Utc::now(),
        }
    }
}

impl RunProgress {
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.position)
    }

    /// Percentage through the set (0.0 to 100.0).
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            if self.status == RunState::Complete {
                100.0
            } else {
                0.0
            }
        } else {
            (self.position.min(self.total) as f64 / self.total as f64) * 100.0
        }
    }

    pub fn report(&self) -> ProgressReport {
        ProgressReport {
            processed: self.position,
            total: self.total,
            remaining: self.remaining(),
            percent_complete: (self.percent_complete() * 10.0).round() / 10.0,
            status: self.status,
            message: self.message.clone(),
        }
    }
}

/// Polling response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub processed: u64,
    pub total: u64,
    pub remaining: u64,
    pub percent_complete: f64,
    pub status: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Single-writer progress channel. Readers subscribe or take snapshots.
#[derive(Debug)]
pub struct ProgressTracker {
    tx: watch::Sender<RunProgress>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunProgress::default());
        Self { tx }
    }

    fn update(&self, f: impl FnOnce(&mut RunProgress)) {
        self.tx.send_modify(|progress| {
            f(progress);
            progress.updated_at = Utc::now();
        });
    }

    pub fn transition(&self, status: RunState) {
        self.update(|p| p.status = status);
    }

    pub fn set_total(&self, total: u64) {
        self.update(|p| p.total = total);
    }

    pub fn set_position(&self, position: u64) {
        self.update(|p| p.position = position);
    }

    pub fn add_fetched(&self, count: u64) {
        self.update(|p| p.fetched += count);
    }

    pub fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|p| p.message = Some(message));
    }

    /// Terminal error state with its reason.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.update(|p| {
            p.status = RunState::Error;
            p.message = Some(reason);
        });
    }

    pub fn snapshot(&self) -> RunProgress {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunProgress> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_math() {
        let tracker = ProgressTracker::new();
        tracker.transition(RunState::Applying);
        tracker.set_total(400);
        tracker.set_position(100);

        let report = tracker.snapshot().report();
        assert_eq!(report.processed, 100);
        assert_eq!(report.remaining, 300);
        assert_eq!(report.percent_complete, 25.0);
        assert_eq!(report.status, RunState::Applying);
    }

    #[test]
    fn test_empty_set_complete_is_full() {
        let tracker = ProgressTracker::new();
        assert_eq!(tracker.snapshot().percent_complete(), 0.0);
        tracker.transition(RunState::Complete);
        assert_eq!(tracker.snapshot().percent_complete(), 100.0);
    }

    #[test]
    fn test_fail_records_reason() {
        let tracker = ProgressTracker::new();
        tracker.fail("cycle detected");
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.status, RunState::Error);
        assert_eq!(snapshot.message.as_deref(), Some("cycle detected"));
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let tracker = ProgressTracker::new();
        let mut rx = tracker.subscribe();
        tracker.set_position(3);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().position, 3);
    }
}
