//! Portway CLI entry point.

mod commands;
mod config;
mod snapshot;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "portway")]
#[command(about = "Expose local services to the internet through secure tunnels")]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file. Defaults to ./portway.yaml,
    /// ~/.portway/config.yaml or /etc/portway/config.yaml.
    #[arg(long, global = true, env = "PORTWAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the agent and run all auto-start tunnels until interrupted.
    Start(commands::start::StartArgs),
    /// Show the status of a running agent.
    Status(commands::status::StatusArgs),
    /// Authentication commands.
    Auth {
        #[command(subcommand)]
        command: commands::auth::AuthCommand,
    },
    /// Tunnel management commands.
    Tunnels {
        #[command(subcommand)]
        command: commands::tunnels::TunnelsCommand,
    },
    /// Show the effective configuration.
    Config {
        #[command(subcommand)]
        command: commands::config_cmd::ConfigCommand,
    },
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Start(args) => commands::start::run(cli.config, args).await,
        Command::Status(args) => commands::status::run(args).await,
        Command::Auth { command } => commands::auth::run(cli.config, command).await,
        Command::Tunnels { command } => commands::tunnels::run(cli.config, command).await,
        Command::Config { command } => commands::config_cmd::run(cli.config, command),
    }
}
