//! Error types for Portway

use thiserror::Error;

/// Main error type for Portway agent operations
#[derive(Error, Debug)]
pub enum AgentError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] portway_protocol::ProtocolError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection error
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Control plane request failed
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    /// Control plane returned an unexpected status
    #[error("Control plane returned status {status} for {operation}")]
    ControlPlaneStatus { operation: &'static str, status: u16 },

    /// No healthy links available in the pool
    #[error("No healthy links available in pool")]
    NoHealthyLinks,

    /// Resource has been closed
    #[error("Closed")]
    Closed,

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Tunnel not found
    #[error("Tunnel {0} not found")]
    TunnelNotFound(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Whether the lifecycle may retry after this error (reconnect budget
    /// permitting) or must enter the terminal `Error` state.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Io(_)
            | AgentError::Connection(_)
            | AgentError::Tls(_)
            | AgentError::Timeout(_)
            | AgentError::NoHealthyLinks
            | AgentError::ControlPlane(_) => true,
            // 5xx from the control plane is transient, anything else is not.
            AgentError::ControlPlaneStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Serialization(err.to_string())
    }
}
