//! Raw submission → identity plus allow-listed consent attributes.

use crate::config::AttributeConfig;
use crate::types::{ConsentState, NormalizedEvent, RawEvent};
use std::collections::BTreeMap;

/// Extract identity and tracked attributes in a single scan.
///
/// The last occurrence of a name wins. A value that is not a consent
/// sentinel is ignored for that occurrence.
pub fn normalize(event: &RawEvent, config: &AttributeConfig) -> NormalizedEvent {
    let mut attributes = BTreeMap::new();
    if let Some(default) = config.default_state {
        for attr in &config.tracked {
            attributes.insert(attr.field.clone(), default);
        }
    }

    let mut identity = None;
    for (name, value) in &event.values {
        if *name == config.identity_field {
            let trimmed = value.trim();
            identity = (!trimmed.is_empty()).then(|| trimmed.to_string());
        } else if config.is_tracked(name) {
            if let Some(state) = ConsentState::parse(value) {
                attributes.insert(name.clone(), state);
            }
        }
    }

    NormalizedEvent {
        identity,
        attributes,
        timestamp: event.timestamp,
    }
}

/// Normalize a batch, dropping unusable events. Returns the usable events
/// and the number dropped.
pub fn normalize_all<'a, I>(events: I, config: &AttributeConfig) -> (Vec<NormalizedEvent>, usize)
where
    I: IntoIterator<Item = &'a RawEvent>,
{
    let mut usable = Vec::new();
    let mut unusable = 0;
    for event in events {
        let normalized = normalize(event, config);
        if normalized.is_usable() {
            usable.push(normalized);
        } else {
            unusable += 1;
        }
    }
    (usable, unusable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackedAttribute;

    fn config() -> AttributeConfig {
        AttributeConfig {
            identity_field: "email".into(),
            tracked: vec![
                TrackedAttribute::new("terms"),
                TrackedAttribute::new("marketing"),
            ],
            default_state: None,
        }
    }

    #[test]
    fn test_extracts_identity_and_tracked_attributes() {
        let raw = RawEvent::new(42)
            .with_value("email", "  a@x.com ")
            .with_value("terms", "Checked")
            .with_value("firstname", "Ada")
            .with_value("marketing", "Not Checked");

        let event = normalize(&raw, &config());

        assert_eq!(event.identity.as_deref(), Some("a@x.com"));
        assert_eq!(event.timestamp, 42);
        assert_eq!(event.attributes.len(), 2);
        assert_eq!(event.attributes["terms"], ConsentState::Checked);
        assert_eq!(event.attributes["marketing"], ConsentState::NotChecked);
    }

    #[test]
    fn test_blank_identity_is_unusable() {
        let raw = RawEvent::new(1)
            .with_value("email", "   ")
            .with_value("terms", "Checked");

        let event = normalize(&raw, &config());
        assert!(event.identity.is_none());
        assert!(!event.is_usable());
    }

    #[test]
    fn test_invalid_values_are_dropped_not_defaulted() {
        let raw = RawEvent::new(1)
            .with_value("email", "a@x.com")
            .with_value("terms", "yes please");

        let event = normalize(&raw, &config());
        assert!(event.attributes.is_empty());
    }

    #[test]
    fn test_default_state_preseeds_every_tracked_name() {
        let mut config = config();
        config.default_state = Some(ConsentState::NotChecked);
        let raw = RawEvent::new(1)
            .with_value("email", "a@x.com")
            .with_value("terms", "Checked")
            .with_value("marketing", "garbage");

        let event = normalize(&raw, &config);
        assert_eq!(event.attributes["terms"], ConsentState::Checked);
        assert_eq!(event.attributes["marketing"], ConsentState::NotChecked);
    }

    #[test]
    fn test_last_occurrence_wins() {
        let raw = RawEvent::new(1)
            .with_value("email", "first@x.com")
            .with_value("terms", "Checked")
            .with_value("terms", "Not Checked")
            .with_value("email", "second@x.com");

        let event = normalize(&raw, &config());
        assert_eq!(event.identity.as_deref(), Some("second@x.com"));
        assert_eq!(event.attributes["terms"], ConsentState::NotChecked);
    }

    #[test]
    fn test_normalize_all_counts_unusable() {
        let events = vec![
            RawEvent::new(1).with_value("email", "a@x.com"),
            RawEvent::new(2).with_value("terms", "Checked"),
            RawEvent::new(3).with_value("email", ""),
        ];

        let (usable, unusable) = normalize_all(&events, &config());
        assert_eq!(usable.len(), 1);
        assert_eq!(unusable, 2);
    }
}
