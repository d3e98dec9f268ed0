//! Run command - trigger a reconciliation and follow it to the end
//!
//! The run executes on the job runner's background task. This command only
//! polls its progress channel, so Ctrl-C becomes a cooperative cancel that
//! lands at the next checkpoint flush.

use crate::cli::config::Settings;
use crate::cli::error::HelpfulError;
use crate::cli::output::{format_position, print_report};
use anyhow::{anyhow, Context, Result};
use formsync_core::{
    ConfigError, FileCheckpointStore, JobId, JobRunner, JobStore, Orchestrator, RunMode,
    RunProgress, RunState, SubmissionSource, TriggerRequest,
};
use formsync_hubspot::{HubSpotClient, HubSpotContacts, HubSpotFormSource};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Arguments for the run command
#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Form to reconcile (defaults to source.form_id)
    #[arg(long = "form-id")]
    pub form_id: Option<String>,

    /// Resume right after this identity (case-insensitive)
    #[arg(long = "start-email", value_name = "EMAIL")]
    pub start_email: Option<String>,

    /// Apply at most this many identities
    #[arg(long)]
    pub limit: Option<u64>,

    /// Identities per batched lookup/update (1 = one call per identity)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Fetch, deduplicate and export only; no record updates
    #[arg(long, conflicts_with = "from_snapshot")]
    pub prep: bool,

    /// Apply a previously exported CSV instead of fetching
    #[arg(long = "from-snapshot", value_name = "CSV")]
    pub from_snapshot: Option<PathBuf>,

    /// Write the deduplicated set to this CSV
    #[arg(long, value_name = "CSV")]
    pub export: Option<PathBuf>,

    /// HubSpot private app token
    #[arg(long, env = "HUBSPOT_PRIVATE_APP_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Print the run report as JSON (no progress bar)
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    fn trigger_request(&self) -> TriggerRequest {
        TriggerRequest {
            job_id: self.form_id.clone(),
            mode: if self.prep {
                RunMode::Prep
            } else {
                RunMode::Apply
            },
            start_anchor: self.start_email.clone(),
            limit: self.limit,
            batch_size: self.batch_size,
            snapshot: self.from_snapshot.clone(),
            export: self.export.clone(),
        }
    }
}

/// Execute the run command
pub fn run(args: RunArgs, settings: &Settings) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    rt.block_on(run_async(args, settings))
}

async fn run_async(args: RunArgs, settings: &Settings) -> Result<()> {
    let runner = build_runner(settings, args.token.clone())?;

    let response = runner
        .trigger(args.trigger_request())
        .map_err(|err| HelpfulError::from_trigger(&err))?;
    let job_id = response.job_id;
    info!(job_id = %job_id, mode = %response.mode, "Run started");

    follow(&runner, &job_id, !args.json).await;

    let result = runner
        .wait(&job_id)
        .await
        .ok_or_else(|| anyhow!("Run for {} is not tracked by this process", job_id))?;
    let report = result.map_err(|err| HelpfulError::from_run(job_id.as_str(), &err))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

/// Wire HubSpot adapters and file stores into a runner.
///
/// Every configuration problem surfaces here or in `trigger`, before any
/// request is sent.
fn build_runner(settings: &Settings, token: Option<String>) -> Result<JobRunner> {
    let config = Arc::new(settings.sync.clone());
    config
        .validate()
        .map_err(|err| HelpfulError::from_config(&err))?;

    let client = HubSpotClient::new(&settings.hubspot, token)
        .map_err(|err| HelpfulError::from_config(&err))?;
    let client = Arc::new(client);

    let store = HubSpotContacts::new(client.clone(), settings.hubspot.identity_property.clone());
    let checkpoints = FileCheckpointStore::new(config.paths.checkpoints_dir())
        .context("Failed to open checkpoint directory")?;
    let jobs = JobStore::new(config.paths.jobs_dir())?;
    let orchestrator = Orchestrator::new(config, Arc::new(store), Arc::new(checkpoints));

    let sources = move |form_id: &str| -> Result<Arc<dyn SubmissionSource>, ConfigError> {
        Ok(Arc::new(HubSpotFormSource::new(client.clone(), form_id)))
    };
    Ok(JobRunner::new(orchestrator, sources, jobs))
}

/// Follow progress until the run reaches a terminal state.
async fn follow(runner: &JobRunner, job_id: &JobId, show_bar: bool) {
    let Some(mut rx) = runner.subscribe(job_id) else {
        return;
    };
    let bar = if show_bar {
        progress_bar()
    } else {
        ProgressBar::hidden()
    };

    let mut interrupted = false;
    loop {
        let status = {
            let progress = rx.borrow_and_update();
            render(&bar, &progress);
            progress.status
        };
        if status.is_terminal() {
            break;
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if runner.cancel(job_id) {
                    warn!("Interrupted; stopping at the next checkpoint flush");
                }
            }
        }
    }

    bar.finish_and_clear();
}

fn progress_bar() -> ProgressBar {
    let style = ProgressStyle::with_template(
        "{spinner} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    let bar = ProgressBar::new(0);
    bar.set_style(style);
    bar.enable_steady_tick(std::time::Duration::from_millis(200));
    bar
}

fn render(bar: &ProgressBar, progress: &RunProgress) {
    match progress.status {
        RunState::Idle | RunState::Fetching => {
            bar.set_message(format!("fetching ({} submissions)", progress.fetched));
        }
        RunState::Deduplicating => {
            bar.set_message(format!("deduplicating {} submissions", progress.fetched));
        }
        _ => {
            bar.set_length(progress.total);
            bar.set_position(progress.position);
            bar.set_message(format!(
                "{} {}",
                progress.status,
                format_position(progress.position, progress.total)
            ));
        }
    }
}
