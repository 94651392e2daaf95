//! Configuration types for the Portway agent.
//!
//! The shape mirrors the YAML config file: `server`, `auth`, `tunnels` and
//! `connection` sections. Interval fields are plain seconds in the file;
//! accessors return [`Duration`].

use crate::constants::{
    DEFAULT_API_PORT, DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_DATA_PLANE_PORT,
    DEFAULT_HEARTBEAT_SECS, DEFAULT_MAX_IN_FLIGHT, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_POOL_SIZE, DEFAULT_RECONNECT_SECS,
};
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunnel protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    Http,
    Tcp,
}

impl std::fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelProtocol::Http => write!(f, "http"),
            TunnelProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Rendezvous server domain.
    pub domain: String,
    /// Control-plane HTTPS port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Data-plane TLS port.
    #[serde(default = "default_data_plane_port")]
    pub data_plane_port: u16,
    /// Verify the server TLS certificate.
    #[serde(default = "default_true")]
    pub tls_verify: bool,
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// API key presented as `Authorization: Bearer <api_key>`.
    pub api_key: String,
}

/// One tunnel entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Local name, used for logging and CLI selection.
    pub name: String,
    pub protocol: TunnelProtocol,
    /// Port of the local service being exposed.
    pub local_port: u16,
    /// Requested subdomain (HTTP tunnels).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    /// Start this tunnel when the agent starts.
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

/// Connection pool and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Seconds between heartbeat frames.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval: u64,
    /// Base reconnect backoff, seconds.
    #[serde(default = "default_reconnect")]
    pub reconnect_interval: u64,
    #[serde(default = "default_max_attempts")]
    pub max_reconnect_attempts: u32,
    /// Dial + TLS handshake budget, seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Bound on concurrent in-flight forwarded requests per tunnel.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            heartbeat_interval: DEFAULT_HEARTBEAT_SECS,
            reconnect_interval: DEFAULT_RECONNECT_SECS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT_SECS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl AgentConfig {
    /// Validate the configuration before the manager uses it.
    pub fn validate(&self) -> Result<()> {
        if self.server.domain.is_empty() {
            return Err(AgentError::Config("server.domain is required".into()));
        }
        if self.auth.api_key.is_empty() {
            return Err(AgentError::Config("auth.api_key is required".into()));
        }
        if self.connection.pool_size == 0 {
            return Err(AgentError::Config(
                "connection.pool_size must be at least 1".into(),
            ));
        }
        if self.connection.max_in_flight == 0 {
            return Err(AgentError::Config(
                "connection.max_in_flight must be at least 1".into(),
            ));
        }
        for tunnel in &self.tunnels {
            tunnel.validate()?;
        }
        Ok(())
    }

    /// Data-plane address as `host:port`.
    pub fn data_plane_addr(&self) -> String {
        format!("{}:{}", self.server.domain, self.server.data_plane_port)
    }

    /// Control-plane base URL.
    pub fn api_base_url(&self) -> String {
        format!(
            "https://{}:{}/api/v1",
            self.server.domain, self.server.api_port
        )
    }
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(AgentError::Config("tunnel name is required".into()));
        }
        if self.local_port == 0 {
            return Err(AgentError::Config(format!(
                "tunnel {}: local_port is required",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_data_plane_port() -> u16 {
    DEFAULT_DATA_PLANE_PORT
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_heartbeat() -> u64 {
    DEFAULT_HEARTBEAT_SECS
}

fn default_reconnect() -> u64 {
    DEFAULT_RECONNECT_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_connection_timeout() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT_SECS
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> AgentConfig {
        AgentConfig {
            server: ServerConfig {
                domain: "tunnel.example.com".into(),
                api_port: 443,
                data_plane_port: 7223,
                tls_verify: true,
            },
            auth: AuthConfig {
                api_key: "sk-test".into(),
            },
            tunnels: vec![TunnelConfig {
                name: "web-app".into(),
                protocol: TunnelProtocol::Http,
                local_port: 3000,
                subdomain: Some("myapp".into()),
                auto_start: true,
            }],
            connection: ConnectionConfig::default(),
        }
    }

    #[test]
    fn test_validate_success() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn test_validate_missing_domain() {
        let mut config = sample_config();
        config.server.domain.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("domain"));
    }

    #[test]
    fn test_validate_missing_api_key() {
        let mut config = sample_config();
        config.auth.api_key.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn test_validate_zero_local_port() {
        let mut config = sample_config();
        config.tunnels[0].local_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_addresses() {
        let config = sample_config();
        assert_eq!(config.data_plane_addr(), "tunnel.example.com:7223");
        assert_eq!(
            config.api_base_url(),
            "https://tunnel.example.com:443/api/v1"
        );
    }

    #[test]
    fn test_connection_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.max_in_flight, 100);
    }

    #[test]
    fn test_yaml_round_trip_with_defaults() {
        let yaml = r#"
server:
  domain: tunnel.example.com
auth:
  api_key: sk-test
tunnels:
  - name: db
    protocol: tcp
    local_port: 5432
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.api_port, 443);
        assert_eq!(config.server.data_plane_port, 7223);
        assert!(config.server.tls_verify);
        assert_eq!(config.tunnels.len(), 1);
        assert_eq!(config.tunnels[0].protocol, TunnelProtocol::Tcp);
        assert!(config.tunnels[0].auto_start);
        assert_eq!(config.connection.pool_size, 10);
    }
}
