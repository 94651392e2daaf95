//! Common utilities and types for Portway

pub mod config;
pub mod constants;
pub mod error;

pub use config::{AgentConfig, AuthConfig, ConnectionConfig, ServerConfig, TunnelConfig};
pub use error::{AgentError, Result};
