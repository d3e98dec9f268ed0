//! Helpful error types for CLI commands
//!
//! Every error includes:
//! - What went wrong
//! - Context about the situation
//! - Suggestions for how to fix it

use formsync_core::{
    ConfigError, PaginationError, RunError, SourceError, TriggerError,
};
use std::fmt;
use std::path::Path;

/// An error with helpful context and suggestions
#[derive(Debug)]
pub struct HelpfulError {
    pub message: String,
    pub context: Option<String>,
    pub suggestions: Vec<String>,
}

impl HelpfulError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions(
        mut self,
        suggestions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.suggestions
            .extend(suggestions.into_iter().map(|s| s.into()));
        self
    }

    // === Common error constructors ===

    pub fn config_not_found(path: &Path) -> Self {
        Self::new(format!("Config file not found: {}", path.display()))
            .with_context("--config (or FORMSYNC_CONFIG) names a file that does not exist")
            .with_suggestions([
                format!("TRY: Check the path: ls -la {}", path.display()),
                "TRY: Omit --config to use <home>/config.toml or built-in defaults".to_string(),
            ])
    }

    /// Maps configuration problems found before any network call.
    pub fn from_config(err: &ConfigError) -> Self {
        match err {
            ConfigError::MissingCredential(var) => {
                Self::new("HubSpot credential is not set")
                    .with_context(format!("{} is empty or missing", var))
                    .with_suggestions([
                        format!("TRY: export {}=<private app token>", var),
                        "TRY: Pass --token on the command line".to_string(),
                    ])
            }
            ConfigError::MissingIdentifier(what) => {
                Self::new(format!("Missing {}", what))
                    .with_context("No form id was given and the config has no source.form_id")
                    .with_suggestions([
                        "TRY: formsync run --form-id <FORM_ID>".to_string(),
                        "TRY: Set form_id under [source] in the config file".to_string(),
                    ])
            }
            ConfigError::Read { path, .. } => Self::config_not_found(path),
            ConfigError::Parse { path, source } => {
                Self::new(format!("Invalid config file: {}", path.display()))
                    .with_context(source.to_string())
                    .with_suggestion("TRY: formsync config   # Show the resolved configuration")
            }
            ConfigError::Invalid(reason) => Self::new("Invalid configuration")
                .with_context(reason.clone())
                .with_suggestion("TRY: formsync config   # Show the resolved configuration"),
        }
    }

    pub fn from_trigger(err: &TriggerError) -> Self {
        match err {
            TriggerError::AlreadyRunning(job_id) => {
                Self::new(format!("A run is already active for {}", job_id))
                    .with_suggestion(format!("TRY: formsync status {}", job_id))
            }
            TriggerError::Config(config) => Self::from_config(config),
            TriggerError::Persist(reason) => Self::new("Failed to write the job record")
                .with_context(reason.clone())
                .with_suggestion("TRY: Check permissions of the formsync home directory"),
        }
    }

    pub fn from_run(job_id: &str, err: &RunError) -> Self {
        match err {
            RunError::Pagination {
                source: PaginationError::Source(SourceError::NotFound(_)),
                ..
            } => Self::new(format!("Form {} not found", job_id))
                .with_context(err.to_string())
                .with_suggestion("TRY: Check the form id in HubSpot (Marketing > Forms)"),
            RunError::Pagination {
                source: PaginationError::Source(SourceError::Unauthorized(_)),
                ..
            } => Self::new("HubSpot rejected the credential")
                .with_context(err.to_string())
                .with_suggestion(
                    "TRY: Check the private app token has the forms and crm.objects.contacts scopes",
                ),
            RunError::Pagination { .. } => Self::new(format!("Fetching submissions for {} halted", job_id))
                .with_context(err.to_string())
                .with_suggestions([
                    "TRY: Re-run; nothing was applied and the checkpoint is unchanged".to_string(),
                    "TRY: formsync run --prep to export what can be fetched".to_string(),
                ]),
            RunError::Export(_) => Self::new("Snapshot export or import failed")
                .with_context(err.to_string())
                .with_suggestion("TRY: Check the --export / --from-snapshot path"),
            RunError::Checkpoint(_) => Self::new("Checkpoint storage failed")
                .with_context(err.to_string())
                .with_suggestion(format!("TRY: formsync checkpoint show {}", job_id)),
            RunError::Config(config) => Self::from_config(config),
            RunError::Aborted(_) => Self::new(format!("Run for {} aborted", job_id))
                .with_context(err.to_string())
                .with_suggestion(format!("TRY: formsync status {}", job_id)),
        }
    }
}

impl fmt::Display for HelpfulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: {}", self.message)?;

        if let Some(ctx) = &self.context {
            writeln!(f, "CONTEXT: {}", ctx)?;
        }

        if !self.suggestions.is_empty() {
            writeln!(f)?;
            for suggestion in &self.suggestions {
                writeln!(f, "  {}", suggestion)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for HelpfulError {}

/// Machine-readable failure on stdout for `--json` callers.
pub fn print_json_error(err: &anyhow::Error) {
    let payload = match err.downcast_ref::<HelpfulError>() {
        Some(helpful) => serde_json::json!({
            "error": helpful.message,
            "context": helpful.context,
            "suggestions": helpful.suggestions,
        }),
        None => serde_json::json!({
            "error": format!("{:#}", err),
        }),
    };
    println!("{}", payload);
}
