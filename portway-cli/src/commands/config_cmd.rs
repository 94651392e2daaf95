//! `portway config` — configuration inspection.

use crate::config;
use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration (API key masked).
    Show,
}

pub fn run(config_path: Option<PathBuf>, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let mut config = config::load(config_path)?;
            if !config.auth.api_key.is_empty() {
                config.auth.api_key = mask(&config.auth.api_key);
            }
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn mask(key: &str) -> String {
    if key.len() <= 8 {
        return "****".to_string();
    }
    format!("{}****{}", &key[..4], &key[key.len() - 4..])
}
