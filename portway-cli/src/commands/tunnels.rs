//! `portway tunnels` — tunnel record management via the control plane.

use crate::config;
use anyhow::Result;
use clap::Subcommand;
use portway_agent::control::{ControlPlane, HttpControlPlane};
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum TunnelsCommand {
    /// List all tunnel records for the authenticated user.
    List,
    /// Delete a tunnel record.
    Delete {
        /// Tunnel id to delete.
        tunnel_id: String,
    },
}

pub async fn run(config_path: Option<PathBuf>, command: TunnelsCommand) -> Result<()> {
    let config = config::load(config_path)?;
    let control = HttpControlPlane::new(&config)?;

    match command {
        TunnelsCommand::List => {
            let tunnels = control.list_tunnels().await?;
            if tunnels.is_empty() {
                println!("no tunnels");
                return Ok(());
            }
            println!(
                "{:<20} {:<8} {:<10} {:<10} PUBLIC URL",
                "TUNNEL ID", "PROTO", "STATUS", "PORT"
            );
            for tunnel in tunnels {
                println!(
                    "{:<20} {:<8} {:<10} {:<10} {}",
                    tunnel.id, tunnel.protocol, tunnel.status, tunnel.local_port, tunnel.public_url
                );
            }
        }
        TunnelsCommand::Delete { tunnel_id } => {
            control.delete_tunnel(&tunnel_id).await?;
            println!("deleted {tunnel_id}");
        }
    }
    Ok(())
}
