//! `portway start` — run the agent until interrupted.

use crate::{config, snapshot};
use anyhow::Result;
use clap::Args;
use portway_agent::TunnelManager;
use portway_common::constants::DEFAULT_STATUS_PORT;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Port for the local status snapshot endpoint.
    #[arg(long, default_value_t = DEFAULT_STATUS_PORT, env = "PORTWAY_STATUS_PORT")]
    pub status_port: u16,

    /// Disable the status endpoint.
    #[arg(long)]
    pub no_status: bool,
}

pub async fn run(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    let config = config::load(config_path)?;
    info!(
        domain = %config.server.domain,
        tunnels = config.tunnels.len(),
        "starting portway agent v{}",
        env!("CARGO_PKG_VERSION")
    );

    let manager = Arc::new(TunnelManager::from_config(config)?);

    if !args.no_status {
        snapshot::spawn(Arc::clone(&manager), args.status_port);
    }

    let started = manager.start_all().await;
    if started == 0 {
        warn!("no auto-start tunnels configured; agent is idle");
    } else {
        info!(started, "tunnels started");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.stop_all().await;
    Ok(())
}
