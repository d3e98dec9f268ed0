//! Request and response bodies of the HubSpot endpoints we call.

use formsync_core::{BatchUpdateReport, RawEvent, RecordKey, SourcePage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Error body shared by all endpoints.
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub category: Option<String>,
}

// ============================================================================
// Form submissions (form-integrations v1)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmissionsPage {
    #[serde(default)]
    pub results: Vec<Submission>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub submitted_at: Option<i64>,
    /// Older payloads carry `timestamp` instead of `submittedAt`.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub values: Vec<FieldValue>,
}

/// Name and value stay untyped: non-string entries are dropped, not fatal.
#[derive(Debug, Deserialize)]
pub struct FieldValue {
    #[serde(default)]
    pub name: Value,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub next: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
pub struct NextPage {
    #[serde(default)]
    pub after: String,
}

impl FieldValue {
    fn into_pair(self) -> Option<(String, String)> {
        match (self.name, self.value) {
            (Value::String(name), Value::String(value)) => Some((name, value)),
            _ => None,
        }
    }
}

impl Submission {
    /// Missing `submittedAt` falls back to `timestamp`, then 0.
    pub fn event_time(&self) -> i64 {
        self.submitted_at
            .filter(|at| *at != 0)
            .or(self.timestamp)
            .unwrap_or(0)
    }

    pub fn into_raw_event(self) -> RawEvent {
        let timestamp = self.event_time();
        self.values
            .into_iter()
            .filter_map(FieldValue::into_pair)
            .fold(RawEvent::new(timestamp), |event, (name, value)| {
                event.with_value(name, value)
            })
    }
}

impl SubmissionsPage {
    /// A `paging.next` block means more data; its `after` is the token.
    /// A `next` without a usable `after` is passed through so the
    /// paginator can report the stall.
    pub fn into_source_page(self) -> SourcePage {
        let next = self.paging.and_then(|paging| paging.next);
        let has_more = next.is_some();
        let next_token = next
            .map(|next| next.after.trim().to_string())
            .filter(|after| !after.is_empty());
        SourcePage {
            events: self
                .results
                .into_iter()
                .map(Submission::into_raw_event)
                .collect(),
            has_more,
            next_token,
        }
    }
}

// ============================================================================
// Contacts (CRM v3)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest<'a> {
    pub filter_groups: Vec<FilterGroup<'a>>,
    pub properties: Vec<&'a str>,
    pub limit: u32,
}

#[derive(Debug, Serialize)]
pub struct FilterGroup<'a> {
    pub filters: Vec<Filter<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter<'a> {
    pub property_name: &'a str,
    pub operator: &'static str,
    pub value: &'a str,
}

impl<'a> SearchRequest<'a> {
    /// First contact whose `property` equals `value`.
    pub fn equals(property: &'a str, value: &'a str) -> Self {
        Self {
            filter_groups: vec![FilterGroup {
                filters: vec![Filter {
                    property_name: property,
                    operator: "EQ",
                    value,
                }],
            }],
            properties: vec![property],
            limit: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub results: Vec<ContactObject>,
}

impl SearchResponse {
    pub fn first_key(&self) -> Option<RecordKey> {
        self.results.first().map(|contact| RecordKey::new(&contact.id))
    }
}

#[derive(Debug, Deserialize)]
pub struct ContactObject {
    pub id: String,
    #[serde(default)]
    pub properties: HashMap<String, Option<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReadRequest<'a> {
    pub id_property: &'a str,
    pub inputs: Vec<ObjectId<'a>>,
    pub properties: Vec<&'a str>,
}

impl<'a> BatchReadRequest<'a> {
    pub fn by_property(property: &'a str, values: &'a [String]) -> Self {
        Self {
            id_property: property,
            inputs: values.iter().map(|value| ObjectId { id: value.trim() }).collect(),
            properties: vec![property],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ObjectId<'a> {
    pub id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct PropertiesUpdate<'a> {
    pub properties: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct BatchUpdateRequest<'a> {
    pub inputs: Vec<BatchUpdateInput<'a>>,
}

#[derive(Debug, Serialize)]
pub struct BatchUpdateInput<'a> {
    pub id: &'a str,
    pub properties: &'a BTreeMap<String, String>,
}

/// Body of batch read and batch update. 207 responses carry both lists.
#[derive(Debug, Default, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub results: Vec<ContactObject>,
    #[serde(default)]
    pub errors: Vec<BatchError>,
}

#[derive(Debug, Deserialize)]
pub struct BatchError {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub context: HashMap<String, Vec<String>>,
}

impl BatchError {
    pub fn ids(&self) -> &[String] {
        self.context.get("ids").map(Vec::as_slice).unwrap_or(&[])
    }
}

impl BatchResponse {
    /// Map requested identities to the contacts found for them.
    ///
    /// HubSpot answers with the stored property value, which may differ in
    /// case from what was submitted, so matching ignores case.
    pub fn match_identities(
        &self,
        requested: &[String],
        property: &str,
    ) -> HashMap<String, RecordKey> {
        let found: HashMap<String, &str> = self
            .results
            .iter()
            .filter_map(|contact| {
                contact
                    .properties
                    .get(property)
                    .and_then(Option::as_deref)
                    .map(|value| (value.trim().to_lowercase(), contact.id.as_str()))
            })
            .collect();
        requested
            .iter()
            .filter_map(|identity| {
                found
                    .get(&identity.trim().to_lowercase())
                    .map(|id| (identity.clone(), RecordKey::new(*id)))
            })
            .collect()
    }

    /// Attribute a batch update back to each requested key.
    ///
    /// Errors naming ids in `context.ids` fail those ids. Errors naming no id
    /// fail every requested key that is not listed as a result.
    pub fn update_report(&self, requested: &[RecordKey]) -> BatchUpdateReport {
        let mut report = BatchUpdateReport::default();
        for contact in &self.results {
            report.succeeded.insert(RecordKey::new(&contact.id));
        }

        let mut unattributed = Vec::new();
        for error in &self.errors {
            let reason = error_reason(error);
            if error.ids().is_empty() {
                unattributed.push(reason);
                continue;
            }
            for id in error.ids() {
                let key = RecordKey::new(id);
                report.succeeded.remove(&key);
                report.failed.insert(key, reason.clone());
            }
        }

        if !unattributed.is_empty() {
            let reason = unattributed.join("; ");
            for key in requested {
                if !report.succeeded.contains(key) && !report.failed.contains_key(key) {
                    report.failed.insert(key.clone(), reason.clone());
                }
            }
        }
        report
    }
}

fn error_reason(error: &BatchError) -> String {
    match &error.category {
        Some(category) if !error.message.is_empty() => format!("{}: {}", category, error.message),
        Some(category) => category.clone(),
        None => error.message.clone(),
    }
}
