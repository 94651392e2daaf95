//! Tunnel manager: supervises the set of tunnels in one agent process.

use crate::control::ControlPlane;
use crate::lifecycle::{LifecycleShared, TunnelLifecycle, TunnelSnapshot, TunnelState};
use crate::transport::{tls::TlsTransportConfig, TransportConfig};
use dashmap::DashMap;
use portway_common::config::{AgentConfig, TunnelConfig};
use portway_common::constants::STOP_GRACE_SECS;
use portway_common::{AgentError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct TunnelHandle {
    shared: Arc<LifecycleShared>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct TunnelManager {
    config: AgentConfig,
    transport: TransportConfig,
    control: Arc<dyn ControlPlane>,
    tunnels: DashMap<String, TunnelHandle>,
}

impl TunnelManager {
    pub fn new(
        config: AgentConfig,
        control: Arc<dyn ControlPlane>,
        transport: TransportConfig,
    ) -> Self {
        Self {
            config,
            transport,
            control,
            tunnels: DashMap::new(),
        }
    }

    /// Production wiring: HTTPS control plane and TLS data plane derived
    /// from the configuration.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let control = Arc::new(crate::control::HttpControlPlane::new(&config)?);
        let transport = TransportConfig::Tls(TlsTransportConfig {
            server_name: Some(config.server.domain.clone()),
            ca_cert_path: None,
            skip_verify: !config.server.tls_verify,
        });
        Ok(Self::new(config, control, transport))
    }

    /// Start one tunnel. Returns once its lifecycle has left
    /// `Initializing` (not necessarily reached `Active`).
    pub async fn start(&self, tunnel: TunnelConfig) -> Result<()> {
        tunnel.validate()?;
        if self.tunnels.contains_key(&tunnel.name) {
            return Err(AgentError::InvalidState(format!(
                "tunnel {} is already running",
                tunnel.name
            )));
        }

        info!(
            tunnel = %tunnel.name,
            protocol = %tunnel.protocol,
            local_port = tunnel.local_port,
            subdomain = tunnel.subdomain.as_deref().unwrap_or(""),
            "starting tunnel"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (lifecycle, shared) = TunnelLifecycle::new(
            tunnel.clone(),
            self.config.connection.clone(),
            self.config.data_plane_addr(),
            self.transport.clone(),
            Arc::clone(&self.control),
            shutdown_rx,
        );

        let mut state_rx = shared.subscribe();
        let task = tokio::spawn(lifecycle.run());
        self.tunnels.insert(
            tunnel.name.clone(),
            TunnelHandle {
                shared,
                shutdown_tx,
                task,
            },
        );

        // Block until the lifecycle makes its first transition.
        while *state_rx.borrow_and_update() == TunnelState::Initializing {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Start every `auto_start` tunnel from the configuration. Individual
    /// failures are logged; returns the number started.
    pub async fn start_all(&self) -> usize {
        let tunnels: Vec<TunnelConfig> = self
            .config
            .tunnels
            .iter()
            .filter(|t| t.auto_start)
            .cloned()
            .collect();

        let mut started = 0;
        for tunnel in tunnels {
            match self.start(tunnel.clone()).await {
                Ok(()) => started += 1,
                Err(e) => warn!(tunnel = %tunnel.name, error = %e, "failed to start tunnel"),
            }
        }
        started
    }

    /// Stop a tunnel by name or by its control-plane id. Waits (bounded)
    /// for the lifecycle to reach its terminal state, then removes it.
    pub async fn stop(&self, key: &str) -> Result<()> {
        let name = self
            .tunnels
            .iter()
            .find(|entry| {
                entry.key() == key || entry.value().shared.tunnel_id().as_deref() == Some(key)
            })
            .map(|entry| entry.key().clone())
            .ok_or_else(|| AgentError::TunnelNotFound(key.to_string()))?;

        let Some((_, handle)) = self.tunnels.remove(&name) else {
            return Err(AgentError::TunnelNotFound(key.to_string()));
        };

        info!(tunnel = %name, "stopping tunnel");
        let _ = handle.shutdown_tx.send(true);

        let mut task = handle.task;
        if tokio::time::timeout(Duration::from_secs(STOP_GRACE_SECS), &mut task)
            .await
            .is_err()
        {
            warn!(tunnel = %name, "lifecycle did not stop in time, aborting");
            task.abort();
        }
        Ok(())
    }

    /// Stop every tunnel concurrently; returns after all have terminated.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        let stops = names.iter().map(|name| self.stop(name));
        for result in futures::future::join_all(stops).await {
            if let Err(e) = result {
                warn!(error = %e, "stop failed");
            }
        }
    }

    /// Non-blocking snapshot of every known tunnel.
    pub fn list(&self) -> Vec<TunnelSnapshot> {
        self.tunnels
            .iter()
            .map(|entry| entry.value().shared.snapshot())
            .collect()
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }
}
