//! Settings resolution and the `config` command
//!
//! The config file holds every [`SyncConfig`] section plus `[hubspot]`.
//! The credential never comes from the file, only from the environment or
//! the command line.

use crate::cli::error::HelpfulError;
use formsync_core::paths::formsync_home;
use formsync_core::{ConfigError, SyncConfig};
use formsync_hubspot::{HubSpotConfig, TOKEN_ENV};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";

/// Everything the binary reads from the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub hubspot: HubSpotConfig,
    /// File the settings were read from, if any.
    #[serde(skip)]
    pub source_file: Option<PathBuf>,
}

impl Settings {
    /// Explicit path must exist. Otherwise `<home>/config.toml` is used when
    /// present, else built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(HelpfulError::config_not_found(path).into());
                }
                Self::load(path)
            }
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| {
            HelpfulError::from_config(&ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        })?;
        let mut settings = Self::from_toml_str(&raw).map_err(|source| {
            HelpfulError::from_config(&ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
        })?;
        settings.source_file = Some(path.to_path_buf());
        Ok(settings)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

pub fn default_config_path() -> PathBuf {
    formsync_home().join(CONFIG_FILE)
}

/// Arguments for the config command
#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    /// Show resolved paths and configuration in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Run the config command - shows resolved paths and settings
pub fn run(args: ConfigArgs, settings: &Settings) -> anyhow::Result<()> {
    let paths = &settings.sync.paths;
    let home = paths.home_dir();
    let checkpoints = paths.checkpoints_dir();
    let jobs = paths.jobs_dir();
    let logs = paths.logs_dir();
    let token_set = std::env::var(TOKEN_ENV)
        .map(|token| !token.trim().is_empty())
        .unwrap_or(false);
    let validation = settings.sync.validate().err().map(|err| err.to_string());

    if args.json {
        let config = serde_json::json!({
            "home": home.to_string_lossy(),
            "config_file": settings.source_file.as_ref().map(|p| p.to_string_lossy().to_string()),
            "checkpoints": {
                "path": checkpoints.to_string_lossy(),
                "exists": checkpoints.exists(),
            },
            "jobs": {
                "path": jobs.to_string_lossy(),
                "exists": jobs.exists(),
            },
            "logs": {
                "path": logs.to_string_lossy(),
                "exists": logs.exists(),
            },
            "credential": {
                "env": TOKEN_ENV,
                "set": token_set,
            },
            "valid": validation.is_none(),
            "validation_error": validation,
            "settings": settings,
        });
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("FORMSYNC CONFIGURATION");
        println!("======================");
        println!();
        println!("Home:        {}", home.display());
        match &settings.source_file {
            Some(path) => println!("Config file: {}", path.display()),
            None => println!("Config file: (none, using defaults)"),
        }
        println!();
        println!("Checkpoints: {}", describe(&checkpoints));
        println!("Jobs:        {}", describe(&jobs));
        println!("Logs:        {}", describe(&logs));
        println!();
        println!(
            "Form id:     {}",
            settings.sync.source.form_id.as_deref().unwrap_or("(not set)")
        );
        println!("HubSpot:     {}", settings.hubspot.base_url);
        println!(
            "Credential:  {} ({})",
            TOKEN_ENV,
            if token_set { "set" } else { "not set" }
        );
        println!(
            "Tracked:     {}",
            settings
                .sync
                .attributes
                .tracked
                .iter()
                .map(|attr| attr.field.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        if let Some(reason) = validation {
            println!();
            println!("WARNING: {}", reason);
        }
    }

    Ok(())
}

fn describe(path: &Path) -> String {
    format!(
        "{} ({})",
        path.display(),
        if path.exists() { "exists" } else { "not found" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hubspot_section_sits_beside_sync_sections() {
        let settings = Settings::from_toml_str(
            r#"
            [source]
            form_id = "f-1"
            page_size = 25

            [apply]
            batch_size = 10

            [hubspot]
            base_url = "http://localhost:8080"
            "#,
        )
        .unwrap();

        assert_eq!(settings.sync.source.form_id.as_deref(), Some("f-1"));
        assert_eq!(settings.sync.source.page_size, 25);
        assert_eq!(settings.sync.apply.batch_size, 10);
        assert_eq!(settings.hubspot.base_url, "http://localhost:8080");
        assert_eq!(settings.hubspot.identity_property, "email");
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.hubspot, HubSpotConfig::default());
        assert!(settings.sync.validate().is_ok());
    }

    #[test]
    fn test_example_config_parses_and_validates() {
        let settings =
            Settings::from_toml_str(include_str!("../../../../formsync.example.toml")).unwrap();
        assert!(settings.sync.validate().is_ok());
        assert_eq!(settings.sync.attributes.tracked.len(), 2);
        assert_eq!(settings.hubspot, HubSpotConfig::default());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let err = Settings::resolve(Some(Path::new("/nonexistent/formsync.toml"))).unwrap_err();
        assert!(err.downcast_ref::<HelpfulError>().is_some());
    }
}
