//! `portway auth` — authentication commands.

use crate::config;
use anyhow::Result;
use clap::Subcommand;
use portway_agent::control::{ControlPlane, HttpControlPlane};
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Validate the configured API key against the server.
    Test,
}

pub async fn run(config_path: Option<PathBuf>, command: AuthCommand) -> Result<()> {
    match command {
        AuthCommand::Test => {
            let config = config::load(config_path)?;
            let control = HttpControlPlane::new(&config)?;
            let info = control.validate_token().await?;
            println!("authentication ok");
            println!("  user_id:   {}", info.user_id);
            println!("  auth_type: {}", info.auth_type);
            Ok(())
        }
    }
}
