//! Configuration file loading for the CLI.

use anyhow::{bail, Context, Result};
use portway_common::AgentConfig;
use std::path::{Path, PathBuf};

/// Candidate locations, first match wins.
fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("portway.yaml"), PathBuf::from("portway.yml")];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(Path::new(&home).join(".portway").join("config.yaml"));
    }
    paths.push(PathBuf::from("/etc/portway/config.yaml"));
    paths
}

/// Load and validate the agent configuration.
pub fn load(explicit: Option<PathBuf>) -> Result<AgentConfig> {
    let path = match explicit {
        Some(path) => path,
        None => match default_paths().into_iter().find(|p| p.exists()) {
            Some(path) => path,
            None => bail!(
                "no configuration file found; create portway.yaml or pass --config"
            ),
        },
    };

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: AgentConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;

    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}
