//! `portway status` — query a running agent's snapshot endpoint.

use anyhow::{Context, Result};
use clap::Args;
use portway_common::constants::DEFAULT_STATUS_PORT;
use serde_json::Value;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Port of the running agent's status endpoint.
    #[arg(long, default_value_t = DEFAULT_STATUS_PORT, env = "PORTWAY_STATUS_PORT")]
    pub status_port: u16,

    /// Print raw JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: StatusArgs) -> Result<()> {
    let url = format!("http://127.0.0.1:{}/api/tunnels", args.status_port);
    let snapshots: Vec<Value> = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .context("is the agent running? (portway start)")?
        .json()
        .await
        .context("unexpected response from status endpoint")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("no tunnels");
        return Ok(());
    }

    println!(
        "{:<16} {:<20} {:<13} {:<40} ERROR",
        "NAME", "TUNNEL ID", "STATE", "PUBLIC URL"
    );
    for snapshot in &snapshots {
        println!(
            "{:<16} {:<20} {:<13} {:<40} {}",
            snapshot["name"].as_str().unwrap_or("-"),
            snapshot["tunnel_id"].as_str().unwrap_or("-"),
            snapshot["state"].as_str().unwrap_or("-"),
            snapshot["public_url"].as_str().unwrap_or("-"),
            snapshot["last_error"].as_str().unwrap_or(""),
        );
    }
    Ok(())
}
