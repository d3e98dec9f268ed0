//! Health command - constant-time liveness output

use formsync_core::HealthStatus;

#[derive(Debug, clap::Args)]
pub struct HealthArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: &HealthArgs) -> anyhow::Result<()> {
    let health = HealthStatus::ok();
    if args.json {
        println!("{}", serde_json::to_string(&health)?);
    } else {
        println!("{} (formsync {})", health.status, health.version);
    }
    Ok(())
}
