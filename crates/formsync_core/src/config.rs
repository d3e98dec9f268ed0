//! Run configuration.
//!
//! One [`SyncConfig`] is built at startup (TOML file plus CLI overrides) and
//! passed by reference to every pipeline stage. Nothing reads configuration
//! from globals.

use crate::paths;
use crate::types::ConsentState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. All of them are raised before any network call.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Missing required identifier: {0}")]
    MissingIdentifier(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Top-level configuration for a reconciliation job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub source: SourceConfig,
    pub attributes: AttributeConfig,
    pub pacing: PacingConfig,
    pub apply: ApplyConfig,
    pub paths: PathsConfig,
}

impl SyncConfig {
    /// Load from a TOML file. Missing sections fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attributes.identity_field.trim().is_empty() {
            return Err(ConfigError::invalid("attributes.identity_field is empty"));
        }
        if self.attributes.tracked.is_empty() {
            return Err(ConfigError::invalid("attributes.tracked is empty"));
        }
        if self.source.page_size == 0 {
            return Err(ConfigError::invalid("source.page_size must be positive"));
        }
        if self.apply.batch_size == 0 {
            return Err(ConfigError::invalid("apply.batch_size must be positive"));
        }
        if self.apply.flush_interval == 0 {
            return Err(ConfigError::invalid("apply.flush_interval must be positive"));
        }
        if self.pacing.min_delay_ms > self.pacing.max_delay_ms {
            return Err(ConfigError::invalid(format!(
                "pacing.min_delay_ms ({}) exceeds pacing.max_delay_ms ({})",
                self.pacing.min_delay_ms, self.pacing.max_delay_ms
            )));
        }
        if self.pacing.call_timeout_secs == 0 {
            return Err(ConfigError::invalid("pacing.call_timeout_secs must be positive"));
        }
        Ok(())
    }
}

/// Submission source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Default form id when a trigger does not name one.
    pub form_id: Option<String>,
    /// Requested page size, capped by the source's own maximum.
    pub page_size: usize,
    /// Hard stop on the number of pages fetched per run.
    pub max_pages: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            form_id: None,
            page_size: 50,
            max_pages: 9999,
        }
    }
}

/// One allow-listed consent attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAttribute {
    /// Field name in the submission.
    pub field: String,
    /// Property name in the record store. Defaults to `field`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    /// Column header in exports. Defaults to `field`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl TrackedAttribute {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            property: None,
            label: None,
        }
    }

    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn property_name(&self) -> &str {
        self.property.as_deref().unwrap_or(&self.field)
    }

    pub fn column_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.field)
    }
}

/// Identity field and the consent allow-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeConfig {
    pub identity_field: String,
    pub tracked: Vec<TrackedAttribute>,
    /// When set, every tracked attribute starts at this state and is
    /// overwritten by a valid submitted value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_state: Option<ConsentState>,
}

impl AttributeConfig {
    pub fn tracked(&self, field: &str) -> Option<&TrackedAttribute> {
        self.tracked.iter().find(|attr| attr.field == field)
    }

    pub fn is_tracked(&self, field: &str) -> bool {
        self.tracked(field).is_some()
    }
}

impl Default for AttributeConfig {
    fn default() -> Self {
        Self {
            identity_field: "email".to_string(),
            tracked: vec![
                TrackedAttribute::new(
                    "i_agree_to_vrm_mortgage_services_s_terms_of_service_and_privacy_policy",
                )
                .with_label("consent_terms"),
                TrackedAttribute::new(
                    "select_to_receive_information_from_vrm_mortgage_services_regarding_events_and_property_information",
                )
                .with_label("consent_marketing"),
            ],
            default_state: None,
        }
    }
}

/// Pacing against the rate-limited APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Delay used when the API reported nothing usable.
    pub default_delay_ms: u64,
    /// Window length assumed when the API reports a near-empty quota but no interval.
    pub window_ms: u64,
    /// A remaining count at or below this value counts as exhausted.
    pub near_zero_remaining: u64,
    /// Retry-after waits honored before a rate-limited call counts as failed.
    pub rate_limit_retries: u32,
    pub call_timeout_secs: u64,
}

impl PacingConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn default_delay(&self) -> Duration {
        Duration::from_millis(self.default_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 50,
            max_delay_ms: 10_000,
            default_delay_ms: 600,
            window_ms: 10_000,
            near_zero_remaining: 1,
            rate_limit_retries: 3,
            call_timeout_secs: 30,
        }
    }
}

/// Batch application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Identities per lookup/update call; 1 selects single-record calls.
    pub batch_size: usize,
    /// Processed records between checkpoint flushes.
    pub flush_interval: u64,
    /// Records per run when a trigger does not pass a limit. `None` = to the end.
    pub default_limit: Option<u64>,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            flush_interval: 100,
            default_limit: None,
        }
    }
}

/// Where state lives on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// State directory. Defaults to `FORMSYNC_HOME` or `~/.formsync`.
    pub home: Option<PathBuf>,
    /// Export/snapshot CSV. Defaults to `<home>/exports/<job>.csv`.
    pub export_path: Option<PathBuf>,
}

impl PathsConfig {
    pub fn home_dir(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(paths::formsync_home)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.home_dir().join("checkpoints")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.home_dir().join("jobs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir().join("logs")
    }

    pub fn export_path_for(&self, job_id: &str) -> PathBuf {
        match &self.export_path {
            Some(path) => path.clone(),
            None => self
                .home_dir()
                .join("exports")
                .join(format!("{}.csv", paths::sanitize_name(job_id))),
        }
    }
}
