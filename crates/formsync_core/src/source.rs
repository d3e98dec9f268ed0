//! Submission Source contract.

use crate::governor::{Observed, OutboundError};
use crate::types::RawEvent;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// One page of submissions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePage {
    pub events: Vec<RawEvent>,
    /// The source claims more data exists after this page.
    pub has_more: bool,
    /// Continuation token for the next page.
    pub next_token: Option<String>,
}

impl SourcePage {
    pub fn last(events: Vec<RawEvent>) -> Self {
        Self {
            events,
            has_more: false,
            next_token: None,
        }
    }

    pub fn with_next(events: Vec<RawEvent>, token: impl Into<String>) -> Self {
        Self {
            events,
            has_more: true,
            next_token: Some(token.into()),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("Source rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Source rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Source call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed page: {0}")]
    Malformed(String),

    #[error("Source request failed: {0}")]
    Request(String),
}

impl OutboundError for SourceError {
    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

/// Paginated read access to form submissions.
#[async_trait]
pub trait SubmissionSource: Send + Sync {
    /// Largest page the source will return.
    fn max_page_size(&self) -> usize;

    /// Fetch the page after `token` (`None` = first page).
    async fn fetch_page(
        &self,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<Observed<SourcePage>, SourceError>;
}
