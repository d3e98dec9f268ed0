//! Latest-wins deduplication.

use crate::types::{DedupedEntry, DedupedSet, NormalizedEvent};
use std::collections::HashMap;
use tracing::debug;

/// Keep the latest event per identity.
///
/// Single pass. An event replaces the kept one only when its timestamp is
/// strictly greater, so equal timestamps keep the first-seen event. Entries
/// stay in first-seen order. Events without identity are skipped; callers
/// are expected to have filtered them already.
pub fn dedupe<I>(events: I) -> DedupedSet
where
    I: IntoIterator<Item = NormalizedEvent>,
{
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut entries: Vec<DedupedEntry> = Vec::new();
    let mut seen = 0usize;
    let mut anonymous = 0usize;

    for event in events {
        seen += 1;
        let Some(identity) = event.identity else {
            anonymous += 1;
            continue;
        };

        match index.get(&identity) {
            Some(&slot) => {
                let kept = &mut entries[slot];
                if event.timestamp > kept.timestamp {
                    kept.attributes = event.attributes;
                    kept.timestamp = event.timestamp;
                }
            }
            None => {
                index.insert(identity.clone(), entries.len());
                entries.push(DedupedEntry {
                    identity,
                    attributes: event.attributes,
                    timestamp: event.timestamp,
                });
            }
        }
    }

    if anonymous > 0 {
        debug!("Skipped {} events without identity during dedupe", anonymous);
    }
    debug!("Deduped {} → {} unique identities", seen, entries.len());
    DedupedSet::from_unique(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConsentState;
    use std::collections::BTreeMap;

    fn event(identity: &str, timestamp: i64, state: ConsentState) -> NormalizedEvent {
        let mut attributes = BTreeMap::new();
        attributes.insert("terms".to_string(), state);
        NormalizedEvent {
            identity: Some(identity.to_string()),
            attributes,
            timestamp,
        }
    }

    #[test]
    fn test_latest_wins() {
        let set = dedupe(vec![
            event("a@x.com", 100, ConsentState::NotChecked),
            event("a@x.com", 200, ConsentState::Checked),
        ]);

        assert_eq!(set.len(), 1);
        let entry = set.get(0).unwrap();
        assert_eq!(entry.timestamp, 200);
        assert_eq!(entry.attributes["terms"], ConsentState::Checked);
    }

    #[test]
    fn test_older_event_after_newer_is_ignored() {
        let set = dedupe(vec![
            event("a@x.com", 200, ConsentState::Checked),
            event("a@x.com", 100, ConsentState::NotChecked),
        ]);

        assert_eq!(set.get(0).unwrap().attributes["terms"], ConsentState::Checked);
    }

    #[test]
    fn test_equal_timestamps_keep_first_seen() {
        let set = dedupe(vec![
            event("a@x.com", 5, ConsentState::Checked),
            event("a@x.com", 5, ConsentState::NotChecked),
        ]);

        assert_eq!(set.get(0).unwrap().attributes["terms"], ConsentState::Checked);
    }

    #[test]
    fn test_first_seen_order_and_uniqueness() {
        let set = dedupe(vec![
            event("a", 1, ConsentState::Checked),
            event("b", 5, ConsentState::Checked),
            event("a", 9, ConsentState::NotChecked),
        ]);

        let identities: Vec<&str> = set.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(identities, vec!["a", "b"]);
        assert_eq!(set.get(0).unwrap().timestamp, 9);
        assert_eq!(set.get(1).unwrap().timestamp, 5);
    }

    #[test]
    fn test_dedupe_is_idempotent() {
        let once = dedupe(vec![
            event("a", 3, ConsentState::Checked),
            event("b", 1, ConsentState::NotChecked),
            event("a", 7, ConsentState::NotChecked),
            event("c", 2, ConsentState::Checked),
            event("b", 1, ConsentState::Checked),
        ]);
        let twice = dedupe(once.to_events());

        assert_eq!(once, twice);
    }

    #[test]
    fn test_events_without_identity_are_not_merged() {
        let mut anonymous = event("x", 10, ConsentState::Checked);
        anonymous.identity = None;

        let set = dedupe(vec![anonymous, event("a", 1, ConsentState::Checked)]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(0).unwrap().identity, "a");
    }
}
