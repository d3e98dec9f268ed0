//! Record shapes flowing through the pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const CHECKED: &str = "Checked";
pub const NOT_CHECKED: &str = "Not Checked";

/// Consent state of one tracked attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsentState {
    #[serde(rename = "Checked")]
    Checked,
    #[serde(rename = "Not Checked")]
    NotChecked,
}

impl ConsentState {
    /// Parse a submitted value. Anything other than the two sentinels is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            CHECKED => Some(Self::Checked),
            NOT_CHECKED => Some(Self::NotChecked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checked => CHECKED,
            Self::NotChecked => NOT_CHECKED,
        }
    }
}

impl fmt::Display for ConsentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submission exactly as fetched from the source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawEvent {
    /// `(name, value)` pairs in submission order.
    pub values: Vec<(String, String)>,
    /// Epoch millis, 0 when the source did not report one.
    pub timestamp: i64,
}

impl RawEvent {
    pub fn new(timestamp: i64) -> Self {
        Self {
            values: Vec::new(),
            timestamp,
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.push((name.into(), value.into()));
        self
    }
}

/// Identity plus the allow-listed consent attributes of one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub identity: Option<String>,
    pub attributes: BTreeMap<String, ConsentState>,
    pub timestamp: i64,
}

impl NormalizedEvent {
    /// Events without an identity never reach deduplication.
    pub fn is_usable(&self) -> bool {
        self.identity.is_some()
    }
}

/// The surviving event for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupedEntry {
    pub identity: String,
    pub attributes: BTreeMap<String, ConsentState>,
    pub timestamp: i64,
}

impl DedupedEntry {
    pub fn to_event(&self) -> NormalizedEvent {
        NormalizedEvent {
            identity: Some(self.identity.clone()),
            attributes: self.attributes.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// One entry per distinct identity, in first-seen order.
///
/// Built only by [`crate::dedupe::dedupe`], which guarantees identity uniqueness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupedSet {
    entries: Vec<DedupedEntry>,
}

impl DedupedSet {
    pub(crate) fn from_unique(entries: Vec<DedupedEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DedupedEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&DedupedEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DedupedEntry> {
        self.entries.iter()
    }

    /// Index of an identity, compared case-insensitively after trimming.
    pub fn position_of(&self, identity: &str) -> Option<usize> {
        let needle = identity.trim().to_lowercase();
        self.entries
            .iter()
            .position(|entry| entry.identity.trim().to_lowercase() == needle)
    }

    /// Content fingerprint of the identity sequence.
    ///
    /// Checkpoint positions index into one specific ordering, so the
    /// fingerprint names the target set a checkpoint belongs to.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for entry in &self.entries {
            hasher.update(entry.identity.as_bytes());
            hasher.update(b"\n");
        }
        let hex = hasher.finalize().to_hex();
        hex.as_str()[..16].to_string()
    }

    pub fn to_events(&self) -> Vec<NormalizedEvent> {
        self.entries.iter().map(DedupedEntry::to_event).collect()
    }
}

/// Result of applying one deduplicated entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Updated,
    SkippedNoRecord,
    SkippedNoAttributes,
    Failed(String),
}

impl ApplyOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::SkippedNoRecord | Self::SkippedNoAttributes)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Updated => write!(f, "updated"),
            Self::SkippedNoRecord => write!(f, "skipped (no record)"),
            Self::SkippedNoAttributes => write!(f, "skipped (no attributes)"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Aggregate counts for the slice a run attempted.
///
/// `processed == updated + skipped + errors` holds after every [`record`](Self::record).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub processed: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    /// First position of the attempted slice.
    pub start_position: u64,
    /// Position after the last processed entry.
    pub end_position: u64,
    /// Identity immediately after the last processed entry, if any remain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_identity: Option<String>,
    /// Last processed identity; passing it as the anchor resumes right after it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_identity: Option<String>,
}

impl RunSummary {
    pub fn starting_at(position: u64) -> Self {
        Self {
            start_position: position,
            end_position: position,
            ..Default::default()
        }
    }

    pub fn record(&mut self, identity: &str, outcome: &ApplyOutcome) {
        self.processed += 1;
        self.end_position += 1;
        match outcome {
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::SkippedNoRecord | ApplyOutcome::SkippedNoAttributes => {
                self.skipped += 1
            }
            ApplyOutcome::Failed(_) => self.errors += 1,
        }
        self.last_identity = Some(identity.to_string());
    }

    pub fn is_balanced(&self) -> bool {
        self.processed == self.updated + self.skipped + self.errors
    }
}
