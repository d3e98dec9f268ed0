use crate::client::{ApiFailure, ApiResponse, HubSpotClient};
use crate::wire::{
    BatchReadRequest, BatchResponse, BatchUpdateInput, BatchUpdateRequest, PropertiesUpdate,
    SearchRequest, SearchResponse,
};
use async_trait::async_trait;
use formsync_core::{
    AttributePatch, BatchUpdateReport, Observed, RecordKey, RecordStore, StoreError,
};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Batch read and batch update accept at most 100 inputs.
const MAX_BATCH_SIZE: usize = 100;

const SEARCH_PATH: &str = "/crm/v3/objects/contacts/search";
const BATCH_READ_PATH: &str = "/crm/v3/objects/contacts/batch/read";
const BATCH_UPDATE_PATH: &str = "/crm/v3/objects/contacts/batch/update";

/// HubSpot contacts as a [`RecordStore`], keyed by contact id.
pub struct HubSpotContacts {
    client: Arc<HubSpotClient>,
    identity_property: String,
}

impl HubSpotContacts {
    pub fn new(client: Arc<HubSpotClient>, identity_property: impl Into<String>) -> Self {
        Self {
            client,
            identity_property: identity_property.into(),
        }
    }

    fn transport(&self, err: reqwest::Error) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout(self.client.timeout())
        } else {
            StoreError::Request(err.to_string())
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(response: &ApiResponse) -> Result<T, StoreError> {
        response
            .json()
            .map_err(|err| StoreError::Malformed(err.to_string()))
    }
}

fn classify(response: &ApiResponse) -> StoreError {
    match response.failure() {
        ApiFailure::Unauthorized { message, .. } => StoreError::Unauthorized(message),
        ApiFailure::RateLimited(retry_after) => StoreError::RateLimited { retry_after },
        ApiFailure::NotFound(message) => StoreError::Rejected {
            status: StatusCode::NOT_FOUND.as_u16(),
            message,
        },
        ApiFailure::Status { status, message } => StoreError::Rejected { status, message },
    }
}

#[async_trait]
impl RecordStore for HubSpotContacts {
    fn max_batch_size(&self) -> usize {
        MAX_BATCH_SIZE
    }

    async fn lookup(&self, identity: &str) -> Result<Observed<Option<RecordKey>>, StoreError> {
        let body = SearchRequest::equals(&self.identity_property, identity.trim());
        let response = self
            .client
            .post(SEARCH_PATH, &body)
            .await
            .map_err(|err| self.transport(err))?;
        if !response.is_success() {
            return Err(classify(&response));
        }
        let found: SearchResponse = Self::parse(&response)?;
        if found.total > 1 {
            debug!(matches = found.total, "Several contacts share {}", identity);
        }
        Ok(Observed::new(found.first_key()).with_feedback(response.feedback))
    }

    async fn lookup_batch(
        &self,
        identities: &[String],
    ) -> Result<Observed<HashMap<String, RecordKey>>, StoreError> {
        if identities.is_empty() {
            return Ok(Observed::new(HashMap::new()));
        }
        let body = BatchReadRequest::by_property(&self.identity_property, identities);
        let response = self
            .client
            .post(BATCH_READ_PATH, &body)
            .await
            .map_err(|err| self.transport(err))?;
        if !response.is_success() {
            return Err(classify(&response));
        }
        let batch: BatchResponse = Self::parse(&response)?;
        let found = batch.match_identities(identities, &self.identity_property);
        debug!(
            requested = identities.len(),
            found = found.len(),
            "Batch contact lookup"
        );
        Ok(Observed::new(found).with_feedback(response.feedback))
    }

    async fn update(
        &self,
        key: &RecordKey,
        patch: &AttributePatch,
    ) -> Result<Observed<()>, StoreError> {
        let path = format!("/crm/v3/objects/contacts/{}", key);
        let body = PropertiesUpdate {
            properties: &patch.properties,
        };
        let response = self
            .client
            .patch(&path, &body)
            .await
            .map_err(|err| self.transport(err))?;
        if !response.is_success() {
            return Err(classify(&response));
        }
        Ok(Observed::new(()).with_feedback(response.feedback))
    }

    async fn update_batch(
        &self,
        updates: &[(RecordKey, AttributePatch)],
    ) -> Result<Observed<BatchUpdateReport>, StoreError> {
        if updates.is_empty() {
            return Ok(Observed::new(BatchUpdateReport::default()));
        }
        let body = BatchUpdateRequest {
            inputs: updates
                .iter()
                .map(|(key, patch)| BatchUpdateInput {
                    id: key.as_str(),
                    properties: &patch.properties,
                })
                .collect(),
        };
        let response = self
            .client
            .post(BATCH_UPDATE_PATH, &body)
            .await
            .map_err(|err| self.transport(err))?;

        let requested: Vec<RecordKey> = updates.iter().map(|(key, _)| key.clone()).collect();
        let batch = batch_body(&response)?;
        Ok(Observed::new(batch.update_report(&requested)).with_feedback(response.feedback))
    }
}

/// The per-item body of a batch update, when there is one to attribute.
///
/// Success and multi-status answers must carry one. A 400 has one only when
/// its errors name the offending ids; otherwise the whole batch failed.
fn batch_body(response: &ApiResponse) -> Result<BatchResponse, StoreError> {
    if response.is_success() {
        return HubSpotContacts::parse(response);
    }
    if response.status != StatusCode::BAD_REQUEST {
        return Err(classify(response));
    }
    response
        .json::<BatchResponse>()
        .ok()
        .filter(|batch| batch.errors.iter().any(|error| !error.ids().is_empty()))
        .ok_or_else(|| classify(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use formsync_core::ApplyOutcome;
    use serde_json::json;
    use std::time::Duration;

    fn response(status: u16, body: serde_json::Value) -> ApiResponse {
        ApiResponse {
            status: StatusCode::from_u16(status).unwrap(),
            feedback: None,
            retry_after: None,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_multi_status_update_is_attributed() {
        let response = response(
            207,
            json!({
                "status": "COMPLETE",
                "results": [{"id": "1", "properties": {}}],
                "errors": [{"category": "OBJECT_NOT_FOUND", "message": "gone",
                            "context": {"ids": ["2"]}}]
            }),
        );
        let report = batch_body(&response)
            .unwrap()
            .update_report(&[RecordKey::new("1"), RecordKey::new("2")]);
        assert_eq!(report.outcome_for(&RecordKey::new("1")), ApplyOutcome::Updated);
        assert!(report.outcome_for(&RecordKey::new("2")).is_failed());
    }

    #[test]
    fn test_bad_request_with_ids_is_attributed() {
        let response = response(
            400,
            json!({
                "status": "error",
                "message": "Invalid input",
                "errors": [{"message": "INVALID_OPTION", "context": {"ids": ["7"]}}]
            }),
        );
        let batch = batch_body(&response).unwrap();
        assert_eq!(batch.errors[0].ids().to_vec(), vec!["7".to_string()]);
    }

    #[test]
    fn test_bad_request_without_ids_fails_whole_batch() {
        let response = response(400, json!({"status": "error", "message": "Invalid input"}));
        assert!(matches!(
            batch_body(&response),
            Err(StoreError::Rejected { status: 400, ref message }) if message == "Invalid input"
        ));
    }

    #[test]
    fn test_unreadable_success_body_is_malformed() {
        let garbage = ApiResponse {
            status: StatusCode::OK,
            feedback: None,
            retry_after: None,
            body: "<html>gateway hiccup</html>".to_string(),
        };
        assert!(matches!(batch_body(&garbage), Err(StoreError::Malformed(_))));
    }

    #[test]
    fn test_rate_limit_is_retryable() {
        let mut limited = response(429, json!({"message": "You have reached your secondly limit."}));
        limited.retry_after = Some(Duration::from_secs(1));
        assert!(matches!(
            classify(&limited),
            StoreError::RateLimited { retry_after } if retry_after == Duration::from_secs(1)
        ));
    }
}
