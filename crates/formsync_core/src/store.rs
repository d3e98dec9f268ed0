//! Record Store contract.

use crate::config::AttributeConfig;
use crate::governor::{Observed, OutboundError};
use crate::types::{ApplyOutcome, DedupedEntry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Downstream record key (e.g. a CRM contact id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(pub String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Absolute values for the tracked properties of one record.
///
/// Always a full replacement of the tracked set present on the entry, never
/// an increment, so applying it twice leaves the same final state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributePatch {
    pub properties: BTreeMap<String, String>,
}

impl AttributePatch {
    /// Map an entry's attributes onto store property names.
    pub fn for_entry(entry: &DedupedEntry, config: &AttributeConfig) -> Self {
        let properties = config
            .tracked
            .iter()
            .filter_map(|attr| {
                entry
                    .attributes
                    .get(&attr.field)
                    .map(|state| (attr.property_name().to_string(), state.as_str().to_string()))
            })
            .collect();
        Self { properties }
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Per-item result of a batch update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchUpdateReport {
    pub succeeded: HashSet<RecordKey>,
    pub failed: HashMap<RecordKey, String>,
}

impl BatchUpdateReport {
    pub fn outcome_for(&self, key: &RecordKey) -> ApplyOutcome {
        if let Some(reason) = self.failed.get(key) {
            ApplyOutcome::Failed(reason.clone())
        } else if self.succeeded.contains(key) {
            ApplyOutcome::Updated
        } else {
            ApplyOutcome::Failed("missing from batch response".to_string())
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Store rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed store response: {0}")]
    Malformed(String),

    #[error("Store request failed: {0}")]
    Request(String),
}

impl OutboundError for StoreError {
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

/// Lookup and update access to downstream records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Largest batch accepted by the batched calls.
    fn max_batch_size(&self) -> usize;

    async fn lookup(&self, identity: &str) -> Result<Observed<Option<RecordKey>>, StoreError>;

    /// Resolve many identities. Identities without a record are absent from the map.
    async fn lookup_batch(
        &self,
        identities: &[String],
    ) -> Result<Observed<HashMap<String, RecordKey>>, StoreError>;

    async fn update(
        &self,
        key: &RecordKey,
        patch: &AttributePatch,
    ) -> Result<Observed<()>, StoreError>;

    async fn update_batch(
        &self,
        updates: &[(RecordKey, AttributePatch)],
    ) -> Result<Observed<BatchUpdateReport>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackedAttribute;
    use crate::types::ConsentState;

    #[test]
    fn test_patch_maps_to_property_names() {
        let config = AttributeConfig {
            identity_field: "email".into(),
            tracked: vec![
                TrackedAttribute::new("terms").with_property("hs_terms"),
                TrackedAttribute::new("marketing"),
            ],
            default_state: None,
        };
        let mut attributes = BTreeMap::new();
        attributes.insert("terms".to_string(), ConsentState::Checked);
        let entry = DedupedEntry {
            identity: "a@x.com".into(),
            attributes,
            timestamp: 1,
        };

        let patch = AttributePatch::for_entry(&entry, &config);
        assert_eq!(patch.properties.len(), 1);
        assert_eq!(patch.properties["hs_terms"], "Checked");
    }

    #[test]
    fn test_report_attributes_each_key() {
        let mut report = BatchUpdateReport::default();
        report.succeeded.insert(RecordKey::new("1"));
        report.failed.insert(RecordKey::new("2"), "invalid option".into());

        assert_eq!(report.outcome_for(&RecordKey::new("1")), ApplyOutcome::Updated);
        assert_eq!(
            report.outcome_for(&RecordKey::new("2")),
            ApplyOutcome::Failed("invalid option".into())
        );
        assert!(report.outcome_for(&RecordKey::new("3")).is_failed());
    }
}
