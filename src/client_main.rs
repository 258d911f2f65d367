//! `ptd-client`: runs the workload on the system under test.

use anyhow::{Context, Result};
use clap::Parser;
use ptd_director::client::{self, ShellWorkload};
use ptd_director::config::ClientSettings;
use ptd_director::logging;
use std::path::PathBuf;
use tracing::{error, info};

/// Run a workload under power measurement
#[derive(Parser, Debug)]
#[command(name = "ptd-client")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the client configuration file
    #[arg(short, long, default_value = "config/client.toml")]
    config: PathBuf,

    /// Label included in the session id
    #[arg(long)]
    label: Option<String>,

    /// Director address as host:port
    #[arg(long)]
    addr: Option<String>,

    /// Upload the zipped workload logs after each phase
    #[arg(long)]
    send_logs: bool,

    /// Skip the testing phase
    #[arg(long)]
    ranging_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = ClientSettings::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(label) = args.label {
        settings.client.label = label;
    }
    if let Some(addr) = args.addr {
        settings.client.server_addr = addr;
    }
    settings.client.send_logs |= args.send_logs;
    settings.client.ranging_only |= args.ranging_only;
    settings.validate()?;
    logging::init(&settings.application.log_level);

    let workload = ShellWorkload::new(settings.client.workload.clone());
    match client::run(&settings.client, &workload).await {
        Ok(report) => {
            info!(session = %report.session_id, phases = report.phases.len(), "Run complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Run failed");
            Err(e.into())
        }
    }
}
