use crate::wire::ErrorBody;
use crate::{DEFAULT_BASE_URL, TOKEN_ENV};
use formsync_core::{ConfigError, RateFeedback};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const INTERVAL_HEADER: &str = "x-hubspot-ratelimit-interval-milliseconds";
const MAX_HEADER: &str = "x-hubspot-ratelimit-max";
const REMAINING_HEADER: &str = "x-hubspot-ratelimit-remaining";

/// Wait used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);

/// `[hubspot]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSpotConfig {
    pub base_url: String,
    /// Contact property matched against submission identities.
    pub identity_property: String,
    /// Transport-level timeout for one HTTP exchange.
    pub request_timeout_secs: u64,
}

impl Default for HubSpotConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            identity_property: "email".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Non-success HTTP answers, classified the same way for every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiFailure {
    #[error("unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("too many requests, retry after {0:?}")]
    RateLimited(Duration),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
}

/// A completed HTTP exchange with its body already read.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub feedback: Option<RateFeedback>,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// The `message` of a HubSpot error body, else the raw body.
    pub fn error_message(&self) -> String {
        match serde_json::from_str::<ErrorBody>(&self.body) {
            Ok(body) if !body.message.is_empty() => body.message,
            _ => {
                let raw = self.body.trim();
                if raw.is_empty() {
                    self.status.to_string()
                } else {
                    raw.chars().take(300).collect()
                }
            }
        }
    }

    /// Classify a non-success response.
    pub fn failure(&self) -> ApiFailure {
        let status = self.status.as_u16();
        match self.status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiFailure::Unauthorized {
                status,
                message: self.error_message(),
            },
            StatusCode::TOO_MANY_REQUESTS => {
                ApiFailure::RateLimited(self.retry_after.unwrap_or(DEFAULT_RETRY_AFTER))
            }
            StatusCode::NOT_FOUND => ApiFailure::NotFound(self.error_message()),
            _ => ApiFailure::Status {
                status,
                message: self.error_message(),
            },
        }
    }
}

/// Authenticated HTTP client for one HubSpot account.
pub struct HubSpotClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    timeout: Duration,
}

impl HubSpotClient {
    /// Fails with `MissingCredential` when the token is absent or blank, so a
    /// misconfigured run never reaches the network.
    pub fn new(config: &HubSpotConfig, token: Option<String>) -> Result<Self, ConfigError> {
        let token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ConfigError::MissingCredential(TOKEN_ENV.to_string()))?;
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ConfigError::invalid("hubspot.base_url is empty"));
        }
        if config.request_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "hubspot.request_timeout_secs must be positive",
            ));
        }

        let timeout = Duration::from_secs(config.request_timeout_secs);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ConfigError::invalid(format!("Failed to build HTTP client: {}", err)))?;

        Ok(Self {
            http,
            base_url,
            token,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<ApiResponse, reqwest::Error> {
        self.send(self.http.get(self.url(path)).query(query)).await
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse, reqwest::Error> {
        self.send(self.http.post(self.url(path)).json(body)).await
    }

    pub async fn patch<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse, reqwest::Error> {
        self.send(self.http.patch(self.url(path)).json(body)).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<ApiResponse, reqwest::Error> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        let feedback = rate_feedback(response.headers());
        let retry_after = retry_after(response.headers());
        let url = response.url().path().to_string();
        let body = response.text().await?;

        debug!(
            status = status.as_u16(),
            remaining = feedback.and_then(|f| f.remaining),
            "HubSpot {}",
            url
        );

        Ok(ApiResponse {
            status,
            feedback,
            retry_after,
            body,
        })
    }
}

/// Read the `X-HubSpot-RateLimit-*` headers. `None` when none are present.
pub fn rate_feedback(headers: &HeaderMap) -> Option<RateFeedback> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
    };
    let feedback = RateFeedback {
        interval_ms: read(INTERVAL_HEADER),
        max_requests: read(MAX_HEADER),
        remaining: read(REMAINING_HEADER),
    };
    if feedback == RateFeedback::default() {
        None
    } else {
        Some(feedback)
    }
}

/// `Retry-After` in delta-seconds. HTTP-date values are not honored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn response(status: u16, body: &str) -> ApiResponse {
        ApiResponse {
            status: StatusCode::from_u16(status).unwrap(),
            feedback: None,
            retry_after: None,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_rate_headers_are_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(INTERVAL_HEADER, HeaderValue::from_static("10000"));
        headers.insert(MAX_HEADER, HeaderValue::from_static("100"));
        headers.insert(REMAINING_HEADER, HeaderValue::from_static("97"));

        let feedback = rate_feedback(&headers).unwrap();
        assert_eq!(feedback.interval_ms, Some(10_000));
        assert_eq!(feedback.max_requests, Some(100));
        assert_eq!(feedback.remaining, Some(97));
    }

    #[test]
    fn test_missing_rate_headers_give_none() {
        let mut headers = HeaderMap::new();
        headers.insert(MAX_HEADER, HeaderValue::from_static("lots"));
        assert!(rate_feedback(&headers).is_none());
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_failure_classification() {
        let unauthorized = response(401, r#"{"status":"error","message":"Authentication credentials not found"}"#);
        assert_eq!(
            unauthorized.failure(),
            ApiFailure::Unauthorized {
                status: 401,
                message: "Authentication credentials not found".into()
            }
        );

        let mut limited = response(429, "");
        limited.retry_after = Some(Duration::from_secs(2));
        assert_eq!(limited.failure(), ApiFailure::RateLimited(Duration::from_secs(2)));
        assert_eq!(
            response(429, "").failure(),
            ApiFailure::RateLimited(DEFAULT_RETRY_AFTER)
        );

        assert!(matches!(response(404, "").failure(), ApiFailure::NotFound(_)));
        assert_eq!(
            response(500, "upstream exploded").failure(),
            ApiFailure::Status {
                status: 500,
                message: "upstream exploded".into()
            }
        );
    }

    #[test]
    fn test_blank_token_is_missing_credential() {
        let config = HubSpotConfig::default();
        assert!(matches!(
            HubSpotClient::new(&config, None),
            Err(ConfigError::MissingCredential(_))
        ));
        assert!(matches!(
            HubSpotClient::new(&config, Some("   ".into())),
            Err(ConfigError::MissingCredential(_))
        ));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let config = HubSpotConfig {
            base_url: "http://localhost:9000/".into(),
            ..Default::default()
        };
        let client = HubSpotClient::new(&config, Some("pat-token".into())).unwrap();
        assert_eq!(client.base_url(), "http://localhost:9000");
        assert_eq!(client.url("/crm/v3"), "http://localhost:9000/crm/v3");
    }
}
