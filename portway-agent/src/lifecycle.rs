//! Tunnel lifecycle state machine.
//!
//! Drives one tunnel from creation through registration to active service,
//! and back through disconnection with exponential backoff. Owns the pool,
//! heartbeat, demultiplexer and forwarder for that tunnel.
//!
//! ```text
//! Initializing -> Creating -> Connecting -> Registering -> Active
//!                                  ^                          |
//!                                  +------ Disconnected <-----+
//! ```
//! Any state can fall to `Error` on an unrecoverable fault; `stop()` drives
//! `Disconnected -> Error` (terminal) and deletes the tunnel record.

use crate::control::{ControlPlane, CreateTunnelRequest, TunnelRecord};
use crate::demux::{Demultiplexer, InFlightTable, TaskExit};
use crate::forward::http::HttpForwarder;
use crate::forward::tcp::TcpForwarder;
use crate::forward::Forwarder;
use crate::heartbeat::HeartbeatTask;
use crate::link::{Link, LinkReader};
use crate::outbound::Outbound;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::reconnect::{Backoff, BackoffPolicy};
use crate::stats::TunnelCounters;
use crate::transport::TransportConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use portway_common::config::{ConnectionConfig, TunnelConfig, TunnelProtocol};
use portway_common::constants::{MAX_RECONNECT_DELAY_SECS, STOP_GRACE_SECS};
use portway_common::AgentError;
use portway_protocol::TunnelRegistration;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

/// How long the lifecycle lingers in `Registering` watching for an
/// immediate server-side rejection before declaring the tunnel active.
pub const REGISTRATION_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Initializing,
    Creating,
    Connecting,
    Registering,
    Active,
    Disconnected,
    Error,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelState::Initializing => "initializing",
            TunnelState::Creating => "creating",
            TunnelState::Connecting => "connecting",
            TunnelState::Registering => "registering",
            TunnelState::Active => "active",
            TunnelState::Disconnected => "disconnected",
            TunnelState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Cheap, serializable view of one tunnel for `manager.list()`.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub name: String,
    pub tunnel_id: Option<String>,
    pub public_url: Option<String>,
    pub state: TunnelState,
    pub last_error: Option<String>,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// State shared between a running lifecycle and its manager.
pub struct LifecycleShared {
    name: String,
    tunnel_id: std::sync::RwLock<Option<String>>,
    public_url: std::sync::RwLock<Option<String>>,
    state_tx: watch::Sender<TunnelState>,
    last_error: std::sync::RwLock<Option<String>>,
    generation: Arc<AtomicU64>,
    created_at: DateTime<Utc>,
    updated_at: std::sync::RwLock<DateTime<Utc>>,
}

impl LifecycleShared {
    fn new(name: String) -> Arc<Self> {
        let (state_tx, _) = watch::channel(TunnelState::Initializing);
        let now = Utc::now();
        Arc::new(Self {
            name,
            tunnel_id: std::sync::RwLock::new(None),
            public_url: std::sync::RwLock::new(None),
            state_tx,
            last_error: std::sync::RwLock::new(None),
            generation: Arc::new(AtomicU64::new(1)),
            created_at: now,
            updated_at: std::sync::RwLock::new(now),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TunnelState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state_tx.subscribe()
    }

    pub fn tunnel_id(&self) -> Option<String> {
        self.tunnel_id.read().ok().and_then(|id| id.clone())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn generation_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generation)
    }

    fn set_state(&self, state: TunnelState) {
        let _ = self.state_tx.send_replace(state);
        if let Ok(mut updated) = self.updated_at.write() {
            *updated = Utc::now();
        }
        info!(
            tunnel = %self.name,
            tunnel_id = self.tunnel_id().as_deref().unwrap_or(""),
            state = %state,
            generation = self.generation(),
            "tunnel state changed"
        );
    }

    fn set_error_message(&self, message: String) {
        if let Ok(mut last) = self.last_error.write() {
            *last = Some(message);
        }
    }

    fn record_created(&self, record: &TunnelRecord) {
        if let Ok(mut id) = self.tunnel_id.write() {
            *id = Some(record.id.clone());
        }
        if let Ok(mut url) = self.public_url.write() {
            *url = Some(record.public_url.clone());
        }
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        TunnelSnapshot {
            name: self.name.clone(),
            tunnel_id: self.tunnel_id(),
            public_url: self.public_url.read().ok().and_then(|u| u.clone()),
            state: self.state(),
            last_error: self.last_error.read().ok().and_then(|e| e.clone()),
            generation: self.generation(),
            created_at: self.created_at,
            updated_at: self
                .updated_at
                .read()
                .map(|u| *u)
                .unwrap_or(self.created_at),
        }
    }
}

enum ActiveExit {
    Stopped,
    Failed(String),
}

enum EstablishError {
    Stop,
    Failed(AgentError),
}

pub struct TunnelLifecycle {
    tunnel: TunnelConfig,
    connection: ConnectionConfig,
    server_addr: String,
    transport: TransportConfig,
    control: Arc<dyn ControlPlane>,
    shared: Arc<LifecycleShared>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TunnelLifecycle {
    pub fn new(
        tunnel: TunnelConfig,
        connection: ConnectionConfig,
        server_addr: String,
        transport: TransportConfig,
        control: Arc<dyn ControlPlane>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, Arc<LifecycleShared>) {
        let shared = LifecycleShared::new(tunnel.name.clone());
        (
            Self {
                tunnel,
                connection,
                server_addr,
                transport,
                control,
                shared: Arc::clone(&shared),
                shutdown_rx,
            },
            shared,
        )
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Sleep for `delay`, returning false if stop was requested meanwhile.
    async fn sleep_or_stop(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown_rx.changed() => false,
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(BackoffPolicy {
            base: self.connection.reconnect_interval(),
            cap: Duration::from_secs(MAX_RECONNECT_DELAY_SECS),
            jitter: 0.2,
            max_attempts: Some(self.connection.max_reconnect_attempts),
        })
    }

    /// Drive the tunnel until it reaches a terminal state.
    pub async fn run(mut self) {
        let record = match self.create_with_retry().await {
            CreateOutcome::Created(record) => record,
            CreateOutcome::Stopped => {
                self.finish(None).await;
                return;
            }
            CreateOutcome::Fatal => {
                self.shared.set_state(TunnelState::Error);
                return;
            }
        };
        self.shared.record_created(&record);

        let mut backoff = self.backoff();
        loop {
            self.shared.set_state(TunnelState::Connecting);
            let pool = ConnectionPool::new(
                self.server_addr.clone(),
                self.transport.clone(),
                PoolConfig {
                    size: self.connection.pool_size,
                    connect_timeout: self.connection.connection_timeout(),
                    write_timeout: self.connection.connection_timeout(),
                    ..PoolConfig::default()
                },
            );

            match self.establish(&record, &pool).await {
                Ok((link, reader)) => {
                    self.shared.set_state(TunnelState::Active);
                    backoff.reset();

                    let exit = self.run_active(&record, Arc::clone(&pool), link, reader).await;
                    pool.close().await;

                    match exit {
                        ActiveExit::Stopped => {
                            self.finish(Some(&record)).await;
                            return;
                        }
                        ActiveExit::Failed(reason) => {
                            warn!(
                                tunnel_id = %record.id,
                                reason = %reason,
                                "tunnel disconnected"
                            );
                            self.shared.set_error_message(reason);
                            self.shared.set_state(TunnelState::Disconnected);
                        }
                    }
                }
                Err(EstablishError::Stop) => {
                    pool.close().await;
                    self.finish(Some(&record)).await;
                    return;
                }
                Err(EstablishError::Failed(e)) => {
                    pool.close().await;
                    warn!(tunnel_id = %record.id, error = %e, "connection attempt failed");
                    self.shared.set_error_message(e.to_string());
                    self.shared.set_state(TunnelState::Disconnected);
                }
            }

            match backoff.next_delay() {
                Some(delay) => {
                    info!(
                        tunnel_id = %record.id,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "scheduling reconnect"
                    );
                    if !self.sleep_or_stop(delay).await {
                        self.finish(Some(&record)).await;
                        return;
                    }
                    // New incarnation: frames and tasks stamped with earlier
                    // generations are fenced out from here on.
                    self.shared.bump_generation();
                }
                None => {
                    error!(
                        tunnel_id = %record.id,
                        attempts = backoff.attempts() - 1,
                        "reconnect attempts exhausted"
                    );
                    self.shared.set_state(TunnelState::Error);
                    return;
                }
            }
        }
    }

    async fn create_with_retry(&mut self) -> CreateOutcome {
        self.shared.set_state(TunnelState::Creating);
        let request = CreateTunnelRequest {
            protocol: self.tunnel.protocol.to_string(),
            local_port: self.tunnel.local_port,
            subdomain: self.tunnel.subdomain.clone(),
            public_port: None,
        };

        let mut backoff = self.backoff();
        loop {
            if self.stop_requested() {
                return CreateOutcome::Stopped;
            }
            match self.control.create_tunnel(&request).await {
                Ok(record) => return CreateOutcome::Created(record),
                Err(e) if e.is_retryable() => {
                    self.shared.set_error_message(e.to_string());
                    match backoff.next_delay() {
                        Some(delay) => {
                            warn!(
                                tunnel = %self.tunnel.name,
                                error = %e,
                                delay_ms = delay.as_millis() as u64,
                                "tunnel creation failed, retrying"
                            );
                            if !self.sleep_or_stop(delay).await {
                                return CreateOutcome::Stopped;
                            }
                        }
                        None => {
                            error!(
                                tunnel = %self.tunnel.name,
                                error = %e,
                                "tunnel creation attempts exhausted"
                            );
                            return CreateOutcome::Fatal;
                        }
                    }
                }
                Err(e) => {
                    error!(tunnel = %self.tunnel.name, error = %e, "tunnel creation failed");
                    self.shared.set_error_message(e.to_string());
                    return CreateOutcome::Fatal;
                }
            }
        }
    }

    /// Connect the pool, register, and wait out the grace window.
    async fn establish(
        &mut self,
        record: &TunnelRecord,
        pool: &Arc<ConnectionPool>,
    ) -> std::result::Result<(Arc<Link>, LinkReader), EstablishError> {
        if self.stop_requested() {
            return Err(EstablishError::Stop);
        }

        pool.connect().await.map_err(EstablishError::Failed)?;
        self.shared.set_state(TunnelState::Registering);

        let link = pool.acquire().map_err(EstablishError::Failed)?;
        let registration = TunnelRegistration {
            protocol: record.protocol.clone(),
            local_port: self.tunnel.local_port,
            subdomain: record.subdomain.clone(),
            public_port: None,
            max_connections: self.connection.pool_size as u32,
        };
        let frame = registration
            .into_frame(record.id.as_str())
            .map_err(|e| EstablishError::Failed(e.into()))?;
        link.send(frame).await.map_err(EstablishError::Failed)?;

        let reader = link.take_reader(None).await.ok_or_else(|| {
            EstablishError::Failed(AgentError::InvalidState(
                "link reader already claimed".into(),
            ))
        })?;

        if !self.sleep_or_stop(REGISTRATION_GRACE).await {
            return Err(EstablishError::Stop);
        }
        if !link.is_healthy() {
            return Err(EstablishError::Failed(AgentError::Connection(
                "link failed during registration".into(),
            )));
        }
        Ok((link, reader))
    }

    /// Spawn the heartbeat, demultiplexer and forwarder, then wait for a
    /// stop request or the first child exit.
    async fn run_active(
        &mut self,
        record: &TunnelRecord,
        pool: Arc<ConnectionPool>,
        link: Arc<Link>,
        reader: LinkReader,
    ) -> ActiveExit {
        let tunnel_id = record.id.clone();
        let generation = self.shared.generation();
        let outbound = Outbound::new(tunnel_id.clone(), pool, self.shared.generation_handle());
        let counters = Arc::new(TunnelCounters::new());
        let in_flight: InFlightTable = Arc::new(DashMap::new());
        let (forward_tx, forward_rx) = kanal::bounded_async(self.connection.max_in_flight);
        let (child_shutdown_tx, _) = watch::channel(false);

        let tcp = match self.tunnel.protocol {
            TunnelProtocol::Tcp => Some(TcpForwarder::new(
                tunnel_id.clone(),
                self.tunnel.local_port,
                Arc::clone(&outbound),
                Arc::clone(&counters),
            )),
            TunnelProtocol::Http => None,
        };
        let http = match self.tunnel.protocol {
            TunnelProtocol::Http => {
                match HttpForwarder::new(tunnel_id.clone(), self.tunnel.local_port) {
                    Ok(forwarder) => Some(Arc::new(forwarder)),
                    Err(e) => return ActiveExit::Failed(format!("http forwarder: {e}")),
                }
            }
            TunnelProtocol::Tcp => None,
        };

        let demux = Demultiplexer {
            tunnel_id: tunnel_id.clone(),
            generation,
            protocol: self.tunnel.protocol,
            reader,
            link,
            in_flight: Arc::clone(&in_flight),
            forward_tx,
            tcp: tcp.clone(),
            shutdown: child_shutdown_tx.subscribe(),
        };
        let forwarder = Forwarder {
            protocol: self.tunnel.protocol,
            queue: forward_rx,
            semaphore: Arc::new(Semaphore::new(self.connection.max_in_flight)),
            http,
            tcp: tcp.clone(),
            in_flight: Arc::clone(&in_flight),
            outbound: Arc::clone(&outbound),
            counters: Arc::clone(&counters),
            shutdown: child_shutdown_tx.subscribe(),
        };
        let heartbeat = HeartbeatTask {
            tunnel_id: tunnel_id.clone(),
            outbound: Arc::clone(&outbound),
            counters: Arc::clone(&counters),
            interval: self.connection.heartbeat_interval(),
            shutdown: child_shutdown_tx.subscribe(),
        };

        let (exit_tx, mut exit_rx) = tokio::sync::mpsc::channel::<(&'static str, TaskExit)>(4);
        let mut handles = Vec::with_capacity(3);
        {
            let tx = exit_tx.clone();
            handles.push(tokio::spawn(async move {
                let exit = demux.run().await;
                let _ = tx.send(("demux", exit)).await;
            }));
        }
        {
            let tx = exit_tx.clone();
            handles.push(tokio::spawn(async move {
                let exit = forwarder.run().await;
                let _ = tx.send(("forwarder", exit)).await;
            }));
        }
        {
            let tx = exit_tx;
            handles.push(tokio::spawn(async move {
                let exit = heartbeat.run().await;
                let _ = tx.send(("heartbeat", exit)).await;
            }));
        }

        let outcome = tokio::select! {
            _ = self.shutdown_rx.changed() => ActiveExit::Stopped,
            exit = exit_rx.recv() => match exit {
                Some((task, exit)) if exit == TaskExit::Stopped => {
                    ActiveExit::Failed(format!("{task} stopped unexpectedly"))
                }
                Some((task, exit)) => ActiveExit::Failed(format!("{task}: {exit}")),
                None => ActiveExit::Failed("all tunnel tasks vanished".into()),
            },
        };

        // Drain: signal children, cancel in-flight work, close bridges, and
        // give tasks a bounded window before abandoning them.
        let _ = child_shutdown_tx.send(true);
        for entry in in_flight.iter() {
            entry.cancel.notify_waiters();
        }
        in_flight.clear();
        if let Some(tcp) = &tcp {
            tcp.close_all().await;
        }

        let grace = match outcome {
            ActiveExit::Stopped => Duration::from_secs(STOP_GRACE_SECS),
            ActiveExit::Failed(_) => Duration::from_secs(1),
        };
        let _ = tokio::time::timeout(grace, async {
            for handle in &mut handles {
                let _ = handle.await;
            }
        })
        .await;
        for handle in &handles {
            handle.abort();
        }

        outcome
    }

    /// Terminal stop: best-effort tunnel deletion, then `Error` (terminal).
    async fn finish(&self, record: Option<&TunnelRecord>) {
        self.shared.set_state(TunnelState::Disconnected);
        if let Some(record) = record {
            if let Err(e) = self.control.delete_tunnel(&record.id).await {
                warn!(
                    tunnel_id = %record.id,
                    error = %e,
                    "failed to delete tunnel during stop"
                );
            }
        }
        self.shared.set_state(TunnelState::Error);
        info!(tunnel = %self.shared.name(), "tunnel stopped");
    }
}

enum CreateOutcome {
    Created(TunnelRecord),
    Stopped,
    Fatal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(TunnelState::Active.to_string(), "active");
        assert_eq!(TunnelState::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn test_shared_snapshot_reflects_updates() {
        let shared = LifecycleShared::new("web-app".into());
        assert_eq!(shared.state(), TunnelState::Initializing);

        shared.set_state(TunnelState::Creating);
        shared.set_error_message("boom".into());
        shared.bump_generation();

        let snapshot = shared.snapshot();
        assert_eq!(snapshot.name, "web-app");
        assert_eq!(snapshot.state, TunnelState::Creating);
        assert_eq!(snapshot.last_error.as_deref(), Some("boom"));
        assert_eq!(snapshot.generation, 2);
        assert!(snapshot.tunnel_id.is_none());
    }

    #[test]
    fn test_state_watch_notifies() {
        let shared = LifecycleShared::new("t".into());
        let rx = shared.subscribe();
        shared.set_state(TunnelState::Connecting);
        assert_eq!(*rx.borrow(), TunnelState::Connecting);
    }
}
