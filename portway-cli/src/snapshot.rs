//! Local status snapshot endpoint.
//!
//! Read-only HTTP surface exposing `manager.list()` to the surrounding
//! system (`portway status`, monitoring scripts).

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use portway_agent::{TunnelManager, TunnelSnapshot};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

pub fn router(manager: Arc<TunnelManager>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/tunnels", get(list_tunnels))
        .with_state(manager)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_tunnels(State(manager): State<Arc<TunnelManager>>) -> Json<Vec<TunnelSnapshot>> {
    Json(manager.list())
}

/// Serve the snapshot endpoint in the background.
pub fn spawn(manager: Arc<TunnelManager>, port: u16) {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let app = router(manager);
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(addr = %addr, "status endpoint listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "status endpoint failed");
                }
            }
            Err(e) => error!(addr = %addr, error = %e, "failed to bind status endpoint"),
        }
    });
}
