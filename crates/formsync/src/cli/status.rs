//! Status command - show persisted job records and their checkpoints
//!
//! Reads only the files under the formsync home, so it works from another
//! process while a run is in progress.

use crate::cli::config::Settings;
use crate::cli::error::HelpfulError;
use crate::cli::output::{format_position, format_timestamp, print_table, state_color};
use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, ContentArrangement, Table};
use formsync_core::{CheckpointStore, FileCheckpointStore, JobId, JobRecord, JobStore};

/// Arguments for the status command
#[derive(Debug, clap::Args)]
pub struct StatusArgs {
    /// Job (form) id. Lists every job when omitted
    pub job_id: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: StatusArgs, settings: &Settings) -> Result<()> {
    let paths = &settings.sync.paths;
    let jobs = JobStore::new(paths.jobs_dir())?;

    let Some(job_id) = args.job_id else {
        return list_jobs(&jobs, args.json);
    };
    let job_id = JobId::new(job_id.trim());

    let record = jobs.load(&job_id)?;
    let checkpoints = FileCheckpointStore::new(paths.checkpoints_dir())
        .context("Failed to open checkpoint directory")?
        .list(job_id.as_str())
        .context("Failed to read checkpoints")?;

    if record.is_none() && checkpoints.is_empty() {
        return Err(HelpfulError::new(format!("No runs recorded for {}", job_id))
            .with_suggestions([
                "TRY: formsync status   # List known jobs".to_string(),
                format!("TRY: formsync run --form-id {}", job_id),
            ])
            .into());
    }

    if args.json {
        let output = serde_json::json!({
            "job": record,
            "checkpoints": checkpoints
                .iter()
                .map(|(key, checkpoint)| serde_json::json!({
                    "target_set": key.target_set,
                    "checkpoint": checkpoint,
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("JOB {}", job_id);
    println!();
    match &record {
        Some(record) => print_record(record),
        None => println!("  No job record (checkpoints only)"),
    }

    if !checkpoints.is_empty() {
        println!();
        println!("CHECKPOINTS");
        let rows = checkpoints
            .iter()
            .map(|(key, checkpoint)| {
                vec![
                    key.target_set.clone(),
                    format_position(checkpoint.position, checkpoint.total),
                    checkpoint.success_count.to_string(),
                    checkpoint.error_count.to_string(),
                    format_timestamp(checkpoint.updated_at),
                ]
            })
            .collect();
        print_table(&["TARGET SET", "POSITION", "SUCCESS", "ERRORS", "UPDATED"], rows);
    }
    Ok(())
}

fn print_record(record: &JobRecord) {
    println!("  State:    {}", record.state);
    println!("  Mode:     {}", record.mode);
    println!("  Started:  {}", format_timestamp(record.started_at));
    println!("  Updated:  {}", format_timestamp(record.updated_at));
    if let Some(message) = &record.message {
        println!("  Message:  {}", message);
    }
    if let Some(progress) = &record.progress {
        println!(
            "  Progress: {}/{} ({:.1}%, {} remaining)",
            progress.processed, progress.total, progress.percent_complete, progress.remaining
        );
    }
    if let Some(report) = &record.report {
        let summary = &report.summary;
        println!(
            "  Summary:  processed {} | updated {} | skipped {} | errors {}",
            summary.processed, summary.updated, summary.skipped, summary.errors
        );
        if let Some(next) = &summary.next_identity {
            println!("  Next:     {}", next);
        }
    }
}

fn list_jobs(jobs: &JobStore, json: bool) -> Result<()> {
    let records = jobs.load_all()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No jobs recorded yet.");
        println!();
        println!("  TRY: formsync run --form-id <FORM_ID>");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["JOB", "MODE", "STATE", "PROGRESS", "UPDATED"]);
    for record in &records {
        let progress = record
            .progress
            .as_ref()
            .map(|p| format_position(p.processed, p.total))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(record.job_id.as_str()),
            Cell::new(record.mode.to_string()),
            Cell::new(record.state.as_str()).fg(state_color(record.state)),
            Cell::new(progress),
            Cell::new(format_timestamp(record.updated_at)),
        ]);
    }
    println!("{}", table);
    Ok(())
}
