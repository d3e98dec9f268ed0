//! Cooperative stop for a reconciliation run.
//!
//! `JobRunner::cancel` flips the token; [`BatchApplier`] looks at it only
//! right after a checkpoint flush, via [`CancellationToken::stop_at_flush`].
//! The stored checkpoint therefore always equals the work done before the
//! stop, and an in-flight lookup or update is never abandoned halfway.
//!
//! [`BatchApplier`]: crate::applier::BatchApplier

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Shared stop flag. Clones observe the same request.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    requested: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Called once the checkpoint at `position` is durable. True means the
    /// applier must stop there.
    pub fn stop_at_flush(&self, position: u64) -> bool {
        let stop = self.is_cancelled();
        if stop {
            warn!("Cancellation requested, stopping at position {}", position);
        }
        stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let handle = token.clone();
        assert!(!token.stop_at_flush(10));
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(token.stop_at_flush(10));
    }
}
