//! Paginator - lazy, restartable walk over the submission source.
//!
//! Each call to [`Paginator::next_page`] performs at most one governed fetch.
//! Broken continuation (stall or cycle) is reported as an error on the call
//! *after* the page that exposed it, so every page already fetched is still
//! handed to the caller.

use crate::config::SourceConfig;
use crate::governor::{call_governed, RateGovernor};
use crate::source::{SourceError, SubmissionSource};
use crate::types::RawEvent;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error("Source reported more data after page {page} but returned no continuation token")]
    StallDetected { page: usize },

    #[error("Continuation token repeated after page {page}: {token}")]
    CycleDetected { page: usize, token: String },

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// A halted walk: the error plus every event fetched before it.
#[derive(Debug)]
pub struct PaginationHalt {
    pub error: PaginationError,
    pub fetched: Vec<RawEvent>,
}

pub struct Paginator<'a, S: SubmissionSource + ?Sized> {
    source: &'a S,
    governor: &'a RateGovernor,
    page_size: usize,
    max_pages: usize,
    next_token: Option<String>,
    seen_tokens: HashSet<String>,
    pages_fetched: usize,
    halt: Option<PaginationError>,
    finished: bool,
}

impl<'a, S: SubmissionSource + ?Sized> Paginator<'a, S> {
    pub fn new(source: &'a S, governor: &'a RateGovernor, config: &SourceConfig) -> Self {
        let page_size = config.page_size.clamp(1, source.max_page_size().max(1));
        Self {
            source,
            governor,
            page_size,
            max_pages: config.max_pages,
            next_token: None,
            seen_tokens: HashSet::new(),
            pages_fetched: 0,
            halt: None,
            finished: false,
        }
    }

    /// Continue a previous walk from its last continuation token.
    pub fn resume_from(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.seen_tokens.insert(token.clone());
        self.next_token = Some(token);
        self
    }

    /// Token that the next fetch will send.
    pub fn next_token(&self) -> Option<&str> {
        self.next_token.as_deref()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Fetch the next page. `Ok(None)` means the source is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawEvent>>, PaginationError> {
        if let Some(error) = self.halt.take() {
            self.finished = true;
            return Err(error);
        }
        if self.finished {
            return Ok(None);
        }
        if self.pages_fetched >= self.max_pages {
            info!("Reached max_pages ({}), stopping pagination", self.max_pages);
            self.finished = true;
            return Ok(None);
        }

        let token = self.next_token.take();
        let token_ref = token.as_deref();
        let source = self.source;
        let page_size = self.page_size;
        let page = call_governed(self.governor, move || source.fetch_page(token_ref, page_size))
            .await?;
        self.pages_fetched += 1;

        if page.events.is_empty() {
            debug!("Page {} is empty, stopping pagination", self.pages_fetched);
            self.finished = true;
            return Ok(None);
        }
        info!("Page {}: {} results", self.pages_fetched, page.events.len());

        if page.has_more {
            match page.next_token.filter(|t| !t.trim().is_empty()) {
                None => {
                    warn!("Page {} claims more data without a token", self.pages_fetched);
                    self.halt = Some(PaginationError::StallDetected {
                        page: self.pages_fetched,
                    });
                }
                Some(next) if !self.seen_tokens.insert(next.clone()) => {
                    warn!("Continuation token {} repeated, halting", next);
                    self.halt = Some(PaginationError::CycleDetected {
                        page: self.pages_fetched,
                        token: next,
                    });
                }
                Some(next) => self.next_token = Some(next),
            }
        } else {
            self.finished = true;
        }

        Ok(Some(page.events))
    }

    /// Drain every page.
    pub async fn collect_all(mut self) -> Result<Vec<RawEvent>, PaginationHalt> {
        let mut fetched = Vec::new();
        loop {
            match self.next_page().await {
                Ok(Some(events)) => fetched.extend(events),
                Ok(None) => return Ok(fetched),
                Err(error) => return Err(PaginationHalt { error, fetched }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourcePage;
    use crate::testing::{unthrottled_pacing, MemorySource};

    fn events(prefix: &str, n: usize) -> Vec<RawEvent> {
        (0..n)
            .map(|i| RawEvent::new(i as i64).with_value("email", format!("{}{}@x.com", prefix, i)))
            .collect()
    }

    fn config() -> SourceConfig {
        SourceConfig {
            form_id: None,
            page_size: 50,
            max_pages: 100,
        }
    }

    #[tokio::test]
    async fn test_walks_all_pages() {
        let source = MemorySource::new(vec![
            SourcePage::with_next(events("a", 2), "t1"),
            SourcePage::with_next(events("b", 2), "t2"),
            SourcePage::last(events("c", 1)),
        ]);
        let governor = RateGovernor::new(unthrottled_pacing());

        let all = Paginator::new(&source, &governor, &config())
            .collect_all()
            .await
            .unwrap();

        assert_eq!(all.len(), 5);
        assert_eq!(
            source.requested_tokens(),
            vec![None, Some("t1".to_string()), Some("t2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_cycle_detected() {
        let source = MemorySource::new(vec![
            SourcePage::with_next(events("a", 1), "same"),
            SourcePage::with_next(events("b", 1), "same"),
            SourcePage::with_next(events("c", 1), "same"),
        ]);
        let governor = RateGovernor::new(unthrottled_pacing());

        let halt = Paginator::new(&source, &governor, &config())
            .collect_all()
            .await
            .unwrap_err();

        assert!(matches!(halt.error, PaginationError::CycleDetected { .. }));
        assert_eq!(halt.fetched.len(), 2);
        assert_eq!(source.requested_tokens().len(), 2);
    }

    #[tokio::test]
    async fn test_stall_detected() {
        let source = MemorySource::new(vec![SourcePage {
            events: events("a", 3),
            has_more: true,
            next_token: Some("  ".to_string()),
        }]);
        let governor = RateGovernor::new(unthrottled_pacing());

        let mut paginator = Paginator::new(&source, &governor, &config());
        let first = paginator.next_page().await.unwrap();
        assert_eq!(first.map(|page| page.len()), Some(3));

        let err = paginator.next_page().await.unwrap_err();
        assert!(matches!(err, PaginationError::StallDetected { page: 1 }));
        assert!(paginator.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_page_ends_walk() {
        let source = MemorySource::new(vec![
            SourcePage::with_next(events("a", 1), "t1"),
            SourcePage::with_next(Vec::new(), "t2"),
            SourcePage::last(events("never", 1)),
        ]);
        let governor = RateGovernor::new(unthrottled_pacing());

        let all = Paginator::new(&source, &governor, &config())
            .collect_all()
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_max_pages_and_page_size_cap() {
        let source = MemorySource::new(vec![
            SourcePage::with_next(events("a", 1), "t1"),
            SourcePage::with_next(events("b", 1), "t2"),
            SourcePage::last(events("c", 1)),
        ])
        .with_max_page_size(20);
        let governor = RateGovernor::new(unthrottled_pacing());
        let config = SourceConfig {
            form_id: None,
            page_size: 500,
            max_pages: 2,
        };

        let paginator = Paginator::new(&source, &governor, &config);
        assert_eq!(paginator.page_size(), 20);
        let all = paginator.collect_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(source.requested_page_sizes(), vec![20, 20]);
    }

    #[tokio::test]
    async fn test_source_error_halts_with_fetched_pages() {
        let source = MemorySource::new(vec![SourcePage::with_next(events("a", 2), "t1")])
            .fail_after_pages(SourceError::Malformed("missing results".into()));
        let governor = RateGovernor::new(unthrottled_pacing());

        let halt = Paginator::new(&source, &governor, &config())
            .collect_all()
            .await
            .unwrap_err();
        assert!(matches!(
            halt.error,
            PaginationError::Source(SourceError::Malformed(_))
        ));
        assert_eq!(halt.fetched.len(), 2);
    }
}
