//! Control-plane client.
//!
//! The runtime consumes the [`ControlPlane`] trait; [`HttpControlPlane`] is
//! the production implementation over the server's HTTPS API. Tests swap in
//! a mock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portway_common::{AgentConfig, AgentError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Result of `POST /auth/validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub valid: bool,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub auth_type: String,
}

/// Body of `POST /tunnels`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    pub protocol: String,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
}

/// A tunnel record as assigned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRecord {
    #[serde(rename = "tunnel_id")]
    pub id: String,
    pub protocol: String,
    pub public_url: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    pub local_port: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    tunnels: Vec<TunnelRecord>,
}

/// The control-plane operations the runtime depends on.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn validate_token(&self) -> Result<TokenInfo>;
    async fn create_tunnel(&self, req: &CreateTunnelRequest) -> Result<TunnelRecord>;
    async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>>;
    async fn get_tunnel(&self, tunnel_id: &str) -> Result<TunnelRecord>;
    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()>;
}

/// HTTPS implementation against `https://<domain>:<api_port>/api/v1`.
pub struct HttpControlPlane {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!config.server.tls_verify)
            .build()
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;

        Ok(Self {
            base_url: config.api_base_url(),
            api_key: config.auth.api_key.clone(),
            http,
        })
    }

    /// Override the base URL (tests against a local server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<reqwest::Response> {
        builder
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("{operation}: {e}")))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn validate_token(&self) -> Result<TokenInfo> {
        debug!(base_url = %self.base_url, "validating API token");
        let resp = self
            .send(self.request(reqwest::Method::POST, "/auth/validate"), "validate_token")
            .await?;

        if !resp.status().is_success() {
            return Err(AgentError::ControlPlaneStatus {
                operation: "validate_token",
                status: resp.status().as_u16(),
            });
        }

        let info: TokenInfo = resp
            .json()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("validate_token: {e}")))?;
        if !info.valid {
            return Err(AgentError::Auth("API key rejected by server".into()));
        }
        info!(user_id = %info.user_id, auth_type = %info.auth_type, "token validated");
        Ok(info)
    }

    async fn create_tunnel(&self, req: &CreateTunnelRequest) -> Result<TunnelRecord> {
        debug!(
            protocol = %req.protocol,
            local_port = req.local_port,
            subdomain = ?req.subdomain,
            "creating tunnel"
        );
        let resp = self
            .send(
                self.request(reqwest::Method::POST, "/tunnels").json(req),
                "create_tunnel",
            )
            .await?;

        if resp.status().as_u16() != 201 {
            return Err(AgentError::ControlPlaneStatus {
                operation: "create_tunnel",
                status: resp.status().as_u16(),
            });
        }

        let record: TunnelRecord = resp
            .json()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("create_tunnel: {e}")))?;
        info!(
            tunnel_id = %record.id,
            public_url = %record.public_url,
            status = %record.status,
            "tunnel created"
        );
        Ok(record)
    }

    async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>> {
        let resp = self
            .send(self.request(reqwest::Method::GET, "/tunnels"), "list_tunnels")
            .await?;

        if !resp.status().is_success() {
            return Err(AgentError::ControlPlaneStatus {
                operation: "list_tunnels",
                status: resp.status().as_u16(),
            });
        }

        let list: TunnelList = resp
            .json()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("list_tunnels: {e}")))?;
        Ok(list.tunnels)
    }

    async fn get_tunnel(&self, tunnel_id: &str) -> Result<TunnelRecord> {
        let resp = self
            .send(
                self.request(reqwest::Method::GET, &format!("/tunnels/{tunnel_id}")),
                "get_tunnel",
            )
            .await?;

        if !resp.status().is_success() {
            return Err(AgentError::ControlPlaneStatus {
                operation: "get_tunnel",
                status: resp.status().as_u16(),
            });
        }

        resp.json()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("get_tunnel: {e}")))
    }

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()> {
        let resp = self
            .send(
                self.request(reqwest::Method::DELETE, &format!("/tunnels/{tunnel_id}")),
                "delete_tunnel",
            )
            .await?;

        // Servers answer delete with either 200 or 204.
        match resp.status().as_u16() {
            200 | 204 => {
                info!(tunnel_id = %tunnel_id, "tunnel deleted");
                Ok(())
            }
            status => Err(AgentError::ControlPlaneStatus {
                operation: "delete_tunnel",
                status,
            }),
        }
    }
}
