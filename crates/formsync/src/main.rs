//! formsync command-line entry point
//!
//! Parses arguments, resolves settings, installs logging and dispatches to
//! the command modules under `cli/`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use formsync_logging::{init_logging, LogConfig};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

use cli::config::Settings;

#[derive(Parser, Debug)]
#[command(
    name = "formsync",
    version,
    about = "Reconcile form submission consent into CRM contact properties"
)]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file (TOML). Defaults to <home>/config.toml when it exists
    #[arg(short = 'c', long, global = true, env = "FORMSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch, deduplicate and apply (or export with --prep) a form's submissions
    Run(cli::run::RunArgs),

    /// Show the last run of a job and its checkpoints
    Status(cli::status::StatusArgs),

    /// Inspect or reset stored checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: cli::checkpoint::CheckpointAction,
    },

    /// Liveness probe
    Health(cli::health::HealthArgs),

    /// Show resolved paths and configuration
    Config(cli::config::ConfigArgs),
}

fn command_wants_json(command: &Commands) -> bool {
    match command {
        Commands::Run(args) => args.json,
        Commands::Status(args) => args.json,
        Commands::Checkpoint { action } => action.wants_json(),
        Commands::Health(args) => args.json,
        Commands::Config(args) => args.json,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json_mode = command_wants_json(&cli.command);

    // Health answers without touching disk.
    if let Commands::Health(args) = &cli.command {
        return exit(cli::health::run(args), json_mode);
    }

    let settings = match Settings::resolve(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => return exit(Err(err), json_mode),
    };

    let log_config = LogConfig {
        app_name: "formsync",
        log_dir: settings.sync.paths.logs_dir(),
        verbose: cli.verbose,
        quiet: json_mode,
    };
    if let Err(err) = init_logging(log_config) {
        eprintln!("Warning: failed to initialize logging: {:#}", err);
    }

    let result = run_command(cli.command, settings);
    exit(result, json_mode)
}

fn run_command(command: Commands, settings: Settings) -> Result<()> {
    match command {
        Commands::Run(args) => cli::run::run(args, &settings),
        Commands::Status(args) => cli::status::run(args, &settings),
        Commands::Checkpoint { action } => cli::checkpoint::run(action, &settings),
        Commands::Health(args) => cli::health::run(&args),
        Commands::Config(args) => cli::config::run(args, &settings),
    }
}

fn exit(result: Result<()>, json_mode: bool) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if json_mode {
                cli::error::print_json_error(&err);
            } else {
                eprintln!("{:?}", err);
            }
            ExitCode::from(1)
        }
    }
}
