//! `ptd-server`: the director next to the power analyzer.

use anyhow::{Context, Result};
use clap::Parser;
use ptd_director::config::ServerSettings;
use ptd_director::logging;
use ptd_director::server::Server;
use std::path::PathBuf;
use tracing::info;

/// Drive a PTDaemon power analyzer on behalf of measurement clients
#[derive(Parser, Debug)]
#[command(name = "ptd-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the server configuration file
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = ServerSettings::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    logging::init(&settings.application.log_level);

    let server = Server::bind(&settings)
        .await
        .context("starting the director")?;

    let interrupted = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
        } else {
            std::future::pending::<()>().await;
        }
    };
    server
        .run_until(interrupted)
        .await
        .context("director failed")?;
    Ok(())
}
