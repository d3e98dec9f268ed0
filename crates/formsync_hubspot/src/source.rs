use crate::client::{ApiFailure, ApiResponse, HubSpotClient};
use crate::wire::SubmissionsPage;
use async_trait::async_trait;
use formsync_core::{Observed, SourceError, SourcePage, SubmissionSource};
use std::sync::Arc;
use tracing::debug;

/// Largest `limit` the submissions endpoint accepts.
const MAX_PAGE_SIZE: usize = 50;

/// Submissions of one HubSpot form.
pub struct HubSpotFormSource {
    client: Arc<HubSpotClient>,
    form_id: String,
}

impl HubSpotFormSource {
    pub fn new(client: Arc<HubSpotClient>, form_id: impl Into<String>) -> Self {
        Self {
            client,
            form_id: form_id.into(),
        }
    }

    pub fn form_id(&self) -> &str {
        &self.form_id
    }

    fn path(&self) -> String {
        format!("/form-integrations/v1/submissions/forms/{}", self.form_id)
    }

    fn classify(&self, response: &ApiResponse) -> SourceError {
        match response.failure() {
            ApiFailure::NotFound(_) => {
                SourceError::NotFound(format!("form {} not found", self.form_id))
            }
            ApiFailure::Unauthorized { message, .. } => SourceError::Unauthorized(message),
            ApiFailure::RateLimited(retry_after) => SourceError::RateLimited { retry_after },
            failure @ ApiFailure::Status { .. } => SourceError::Request(failure.to_string()),
        }
    }
}

#[async_trait]
impl SubmissionSource for HubSpotFormSource {
    fn max_page_size(&self) -> usize {
        MAX_PAGE_SIZE
    }

    async fn fetch_page(
        &self,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<Observed<SourcePage>, SourceError> {
        let mut query = vec![("limit", page_size.clamp(1, MAX_PAGE_SIZE).to_string())];
        if let Some(after) = token {
            query.push(("after", after.to_string()));
        }

        let response = self
            .client
            .get(&self.path(), &query)
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    SourceError::Timeout(self.client.timeout())
                } else {
                    SourceError::Request(err.to_string())
                }
            })?;
        if !response.is_success() {
            return Err(self.classify(&response));
        }

        let page: SubmissionsPage = response
            .json()
            .map_err(|err| SourceError::Malformed(err.to_string()))?;
        let page = page.into_source_page();
        debug!(
            form_id = %self.form_id,
            events = page.events.len(),
            has_more = page.has_more,
            "Fetched submissions page"
        );
        Ok(Observed::new(page).with_feedback(response.feedback))
    }
}
