//! Checkpoint command - operator inspection and explicit reset
//!
//! Runs never reset checkpoints on their own. Starting a job over is always
//! this command with `--yes`.

use crate::cli::config::Settings;
use crate::cli::error::HelpfulError;
use crate::cli::output::{format_position, format_timestamp, print_table};
use anyhow::{Context, Result};
use clap::Subcommand;
use formsync_core::{CheckpointKey, CheckpointStore, FileCheckpointStore};

#[derive(Debug, Subcommand)]
pub enum CheckpointAction {
    /// Show every checkpoint of a job
    Show {
        /// Job (form) id
        job_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete checkpoints so the next run starts from the beginning
    Reset {
        /// Job (form) id
        job_id: String,

        /// Only the checkpoint of this target set
        #[arg(long)]
        target: Option<String>,

        /// Confirm the reset
        #[arg(long)]
        yes: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl CheckpointAction {
    pub fn wants_json(&self) -> bool {
        match self {
            Self::Show { json, .. } | Self::Reset { json, .. } => *json,
        }
    }
}

pub fn run(action: CheckpointAction, settings: &Settings) -> Result<()> {
    let store = FileCheckpointStore::new(settings.sync.paths.checkpoints_dir())
        .context("Failed to open checkpoint directory")?;

    match action {
        CheckpointAction::Show { job_id, json } => show(&store, job_id.trim(), json),
        CheckpointAction::Reset {
            job_id,
            target,
            yes,
            json,
        } => reset(&store, job_id.trim(), target.as_deref(), yes, json),
    }
}

fn show(store: &FileCheckpointStore, job_id: &str, json: bool) -> Result<()> {
    let checkpoints = store.list(job_id)?;

    if json {
        let output: Vec<_> = checkpoints
            .iter()
            .map(|(key, checkpoint)| {
                serde_json::json!({
                    "job_id": key.job_id,
                    "target_set": key.target_set,
                    "checkpoint": checkpoint,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if checkpoints.is_empty() {
        println!("No checkpoints for {}", job_id);
        return Ok(());
    }

    let rows = checkpoints
        .iter()
        .map(|(key, checkpoint)| {
            vec![
                key.target_set.clone(),
                format_position(checkpoint.position, checkpoint.total),
                checkpoint.remaining().to_string(),
                checkpoint.success_count.to_string(),
                checkpoint.error_count.to_string(),
                format_timestamp(checkpoint.updated_at),
            ]
        })
        .collect();
    print_table(
        &["TARGET SET", "POSITION", "REMAINING", "SUCCESS", "ERRORS", "UPDATED"],
        rows,
    );
    Ok(())
}

fn reset(
    store: &FileCheckpointStore,
    job_id: &str,
    target: Option<&str>,
    confirmed: bool,
    json: bool,
) -> Result<()> {
    let keys: Vec<CheckpointKey> = match target {
        Some(target) => vec![CheckpointKey::new(job_id, target.trim())],
        None => store.list(job_id)?.into_iter().map(|(key, _)| key).collect(),
    };

    if !confirmed {
        return Err(HelpfulError::new(format!(
            "Refusing to reset {} checkpoint(s) for {} without --yes",
            keys.len(),
            job_id
        ))
        .with_context("The next run would start again from the first identity")
        .with_suggestion(format!("TRY: formsync checkpoint show {}", job_id))
        .into());
    }

    let mut removed = Vec::new();
    for key in &keys {
        if store.reset(key)? {
            removed.push(key.target_set.clone());
        }
    }
    tracing::info!(job_id, removed = removed.len(), "Checkpoints reset");

    if json {
        println!(
            "{}",
            serde_json::json!({ "job_id": job_id, "removed": removed })
        );
    } else if removed.is_empty() {
        println!("No checkpoints to reset for {}", job_id);
    } else {
        println!("Reset {} checkpoint(s) for {}", removed.len(), job_id);
    }
    Ok(())
}
