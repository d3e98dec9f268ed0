//! Rate Governor - pacing against rate-limited APIs
//!
//! [`next_delay`] is a pure function of the last rate-limit feedback. The
//! [`RateGovernor`] wraps it with the shared state needed to pace every
//! outbound call (page fetches, lookups, updates) through one gate, so their
//! combined rate never exceeds the limit.
//!
//! # Delay Rules
//!
//! | Feedback | Delay |
//! |----------|-------|
//! | interval + quota | `interval / quota`, clamped to `[min, max]` |
//! | remaining ≈ 0 | full window (reported interval, else configured) |
//! | nothing usable | configured default |

use crate::config::PacingConfig;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Rate-limit metadata reported by an API response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateFeedback {
    /// Length of the rate-limit window.
    pub interval_ms: Option<u64>,
    /// Requests allowed per window.
    pub max_requests: Option<u64>,
    /// Requests left in the current window.
    pub remaining: Option<u64>,
}

/// A response value together with the rate-limit feedback that came with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed<T> {
    pub value: T,
    pub feedback: Option<RateFeedback>,
}

impl<T> Observed<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            feedback: None,
        }
    }

    pub fn with_feedback(mut self, feedback: Option<RateFeedback>) -> Self {
        self.feedback = feedback;
        self
    }
}

/// Compute the pause before the next call.
pub fn next_delay(config: &PacingConfig, feedback: Option<&RateFeedback>) -> Duration {
    if let Some(feedback) = feedback {
        if let (Some(interval_ms), Some(quota)) = (feedback.interval_ms, feedback.max_requests) {
            if quota > 0 {
                let per_call = Duration::from_micros(interval_ms.saturating_mul(1000) / quota);
                return per_call.clamp(config.min_delay(), config.max_delay());
            }
        }
        if let Some(remaining) = feedback.remaining {
            if remaining <= config.near_zero_remaining {
                return Duration::from_millis(feedback.interval_ms.unwrap_or(config.window_ms));
            }
        }
    }
    config.default_delay()
}

/// Errors from outbound calls that the governed call path needs to classify.
pub trait OutboundError: std::error::Error + Send + Sync + 'static {
    /// Wait requested by an explicit "too many requests" response.
    fn retry_after(&self) -> Option<Duration>;

    /// Build the error reported when a call exceeds its timeout.
    fn timed_out(after: Duration) -> Self;
}

#[derive(Debug, Default)]
struct GovernorState {
    feedback: Option<RateFeedback>,
    next_allowed: Option<Instant>,
}

/// Shared pacing gate for every call to the rate-limited APIs.
#[derive(Debug)]
pub struct RateGovernor {
    config: PacingConfig,
    /// Held across the pacing sleep so concurrent callers queue instead of bursting.
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GovernorState::default()),
        }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Wait until the next call is allowed, then reserve the following slot.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        if let Some(at) = state.next_allowed {
            tokio::time::sleep_until(at).await;
        }
        let delay = next_delay(&self.config, state.feedback.as_ref());
        state.next_allowed = Some(Instant::now() + delay);
    }

    /// Record feedback from the latest response.
    pub async fn observe(&self, feedback: Option<RateFeedback>) {
        if let Some(feedback) = feedback {
            self.state.lock().await.feedback = Some(feedback);
        }
    }

    /// Push the next allowed call out by an explicit retry-after wait.
    pub async fn hold(&self, wait: Duration) {
        let mut state = self.state.lock().await;
        let until = Instant::now() + wait;
        state.next_allowed = Some(match state.next_allowed {
            Some(current) if current > until => current,
            _ => until,
        });
    }

    /// Current delay that would be applied after a call.
    pub async fn current_delay(&self) -> Duration {
        let state = self.state.lock().await;
        next_delay(&self.config, state.feedback.as_ref())
    }
}

/// Run one outbound call through the governor.
///
/// Paces the call, applies the per-call timeout, records feedback, and
/// honors retry-after waits up to the configured retry count. When the
/// retries run out the last rate-limit error is returned.
pub async fn call_governed<T, E, F, Fut>(governor: &RateGovernor, mut call: F) -> Result<T, E>
where
    E: OutboundError,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Observed<T>, E>>,
{
    let timeout = governor.config.call_timeout();
    let mut attempts = 0u32;
    loop {
        governor.acquire().await;
        match tokio::time::timeout(timeout, call()).await {
            Err(_) => return Err(E::timed_out(timeout)),
            Ok(Ok(observed)) => {
                governor.observe(observed.feedback).await;
                return Ok(observed.value);
            }
            Ok(Err(err)) => match err.retry_after() {
                Some(wait) if attempts < governor.config.rate_limit_retries => {
                    attempts += 1;
                    warn!(
                        "Rate limited, waiting {:?} before retry {}/{}",
                        wait, attempts, governor.config.rate_limit_retries
                    );
                    governor.hold(wait).await;
                }
                Some(_) => {
                    debug!("Rate-limit retries exhausted after {} attempts", attempts);
                    return Err(err);
                }
                None => return Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thiserror::Error;

    fn config() -> PacingConfig {
        PacingConfig {
            min_delay_ms: 20,
            max_delay_ms: 2_000,
            default_delay_ms: 600,
            window_ms: 10_000,
            near_zero_remaining: 1,
            rate_limit_retries: 2,
            call_timeout_secs: 30,
        }
    }

    #[test]
    fn test_interval_over_quota() {
        let feedback = RateFeedback {
            interval_ms: Some(10_000),
            max_requests: Some(100),
            remaining: None,
        };
        assert_eq!(
            next_delay(&config(), Some(&feedback)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_delay_is_deterministic() {
        let feedback = RateFeedback {
            interval_ms: Some(10_000),
            max_requests: Some(100),
            remaining: Some(50),
        };
        let first = next_delay(&config(), Some(&feedback));
        let second = next_delay(&config(), Some(&feedback));
        assert_eq!(first, second);
    }

    #[test]
    fn test_delay_is_clamped() {
        let fast = RateFeedback {
            interval_ms: Some(1_000),
            max_requests: Some(1_000),
            remaining: None,
        };
        assert_eq!(next_delay(&config(), Some(&fast)), Duration::from_millis(20));

        let slow = RateFeedback {
            interval_ms: Some(60_000),
            max_requests: Some(2),
            remaining: None,
        };
        assert_eq!(next_delay(&config(), Some(&slow)), Duration::from_millis(2_000));
    }

    #[test]
    fn test_exhausted_window_waits_full_window() {
        let reported = RateFeedback {
            interval_ms: Some(7_000),
            max_requests: None,
            remaining: Some(0),
        };
        assert_eq!(
            next_delay(&config(), Some(&reported)),
            Duration::from_millis(7_000)
        );

        let unreported = RateFeedback {
            interval_ms: None,
            max_requests: None,
            remaining: Some(1),
        };
        assert_eq!(
            next_delay(&config(), Some(&unreported)),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn test_fallback_without_feedback() {
        assert_eq!(next_delay(&config(), None), Duration::from_millis(600));

        let plenty = RateFeedback {
            interval_ms: None,
            max_requests: None,
            remaining: Some(90),
        };
        assert_eq!(next_delay(&config(), Some(&plenty)), Duration::from_millis(600));
    }

    #[test]
    fn test_zero_quota_falls_through() {
        let feedback = RateFeedback {
            interval_ms: Some(10_000),
            max_requests: Some(0),
            remaining: None,
        };
        assert_eq!(next_delay(&config(), Some(&feedback)), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_spaces_calls() {
        let governor = RateGovernor::new(config());
        let start = Instant::now();

        governor.acquire().await;
        governor.acquire().await;
        governor.acquire().await;

        assert!(start.elapsed() >= Duration::from_millis(1_200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_changes_spacing() {
        let governor = RateGovernor::new(config());
        governor
            .observe(Some(RateFeedback {
                interval_ms: Some(10_000),
                max_requests: Some(100),
                remaining: Some(99),
            }))
            .await;

        assert_eq!(governor.current_delay().await, Duration::from_millis(100));
    }

    #[derive(Debug, Error)]
    enum FakeError {
        #[error("slow down")]
        Limited,
        #[error("timed out")]
        Timeout,
    }

    impl OutboundError for FakeError {
        fn retry_after(&self) -> Option<Duration> {
            match self {
                Self::Limited => Some(Duration::from_millis(500)),
                Self::Timeout => None,
            }
        }

        fn timed_out(_after: Duration) -> Self {
            Self::Timeout
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_governed_retries_rate_limits() {
        let governor = RateGovernor::new(config());
        let calls = AtomicU32::new(0);

        let result: Result<u32, FakeError> = call_governed(&governor, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FakeError::Limited)
                } else {
                    Ok(Observed::new(n))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_governed_gives_up_after_retries() {
        let governor = RateGovernor::new(config());
        let calls = AtomicU32::new(0);

        let result: Result<(), FakeError> = call_governed(&governor, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FakeError::Limited) }
        })
        .await;

        assert!(matches!(result, Err(FakeError::Limited)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_governed_times_out() {
        let governor = RateGovernor::new(config());

        let result: Result<(), FakeError> = call_governed(&governor, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Observed::new(()))
        })
        .await;

        assert!(matches!(result, Err(FakeError::Timeout)));
    }
}
