//! Connection pool for data-plane links.
//!
//! All links in one pool terminate at the same `(host, port)` with the same
//! TLS parameters. `acquire` hands out healthy links round-robin and never
//! suspends on I/O; a background monitor probes idle links and replaces the
//! ones that fail.

use crate::link::Link;
use crate::transport::{self, TransportConfig};
use portway_common::constants::{
    DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_POOL_SIZE, HEALTH_CHECK_INTERVAL_SECS,
    HEALTH_PROBE_TIMEOUT_SECS,
};
use portway_common::{AgentError, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of links; the pool never exceeds it.
    pub size: usize,
    /// Dial + TLS handshake budget per link.
    pub connect_timeout: Duration,
    /// Deadline for writing one frame on a link.
    pub write_timeout: Duration,
    /// Health monitor cycle.
    pub health_interval: Duration,
    /// Deadline for one health probe read.
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            health_interval: Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS),
            probe_timeout: Duration::from_secs(HEALTH_PROBE_TIMEOUT_SECS),
        }
    }
}

pub struct ConnectionPool {
    server_addr: String,
    transport: TransportConfig,
    config: PoolConfig,
    links: RwLock<Vec<Arc<Link>>>,
    round_robin: AtomicUsize,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(server_addr: String, transport: TransportConfig, config: PoolConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            server_addr,
            transport,
            config,
            links: RwLock::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown_tx,
            monitor: std::sync::Mutex::new(None),
        })
    }

    /// Establish the initial set of links and start the health monitor.
    ///
    /// Individual dial failures are logged and tolerated; the call fails only
    /// when not a single link could be established.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        info!(
            server_addr = %self.server_addr,
            pool_size = self.config.size,
            "initializing connection pool"
        );

        for _ in 0..self.config.size {
            match self.dial().await {
                Ok(link) => self.insert(link),
                Err(e) => warn!(server_addr = %self.server_addr, error = %e, "failed to establish link"),
            }
        }

        if self.link_count() == 0 {
            return Err(AgentError::Connection(format!(
                "could not establish any link to {}",
                self.server_addr
            )));
        }

        let pool = Arc::clone(self);
        let handle = tokio::spawn(pool.run_monitor());
        if let Ok(mut guard) = self.monitor.lock() {
            *guard = Some(handle);
        }
        Ok(())
    }

    async fn dial(&self) -> Result<Arc<Link>> {
        let stream = transport::connect(&self.transport, &self.server_addr, self.config.connect_timeout)
            .await
            .map_err(|e| AgentError::Connection(format!("{}: {e}", self.server_addr)))?;
        let link = Arc::new(Link::new(stream, self.config.write_timeout));
        debug!(link_id = %link.id(), server_addr = %self.server_addr, "established link");
        Ok(link)
    }

    fn insert(&self, link: Arc<Link>) {
        if let Ok(mut links) = self.links.write() {
            if links.len() < self.config.size {
                links.push(link);
            }
        }
    }

    /// Round-robin over the healthy subset. Never suspends on I/O.
    pub fn acquire(&self) -> Result<Arc<Link>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AgentError::Closed);
        }

        let links = self
            .links
            .read()
            .map_err(|_| AgentError::InvalidState("pool lock poisoned".into()))?;
        let healthy: Vec<&Arc<Link>> = links.iter().filter(|l| l.is_healthy()).collect();
        if healthy.is_empty() {
            return Err(AgentError::NoHealthyLinks);
        }

        let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Ok(Arc::clone(healthy[idx]))
    }

    pub fn link_count(&self) -> usize {
        self.links.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn healthy_count(&self) -> usize {
        self.links
            .read()
            .map(|l| l.iter().filter(|link| link.is_healthy()).count())
            .unwrap_or(0)
    }

    async fn run_monitor(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so
        // fresh links are not probed during startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!(server_addr = %self.server_addr, "health monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.check_and_replace().await;
                }
            }
        }
    }

    /// One monitor cycle: probe idle links, evict failures, dial
    /// replacements up to the configured size.
    async fn check_and_replace(&self) {
        let snapshot: Vec<Arc<Link>> = match self.links.read() {
            Ok(links) => links.clone(),
            Err(_) => return,
        };

        for link in &snapshot {
            if link.is_healthy() {
                link.probe(self.config.probe_timeout).await;
            }
        }

        let removed: usize = {
            let Ok(mut links) = self.links.write() else {
                return;
            };
            let before = links.len();
            links.retain(|l| l.is_healthy());
            before - links.len()
        };

        if removed > 0 {
            warn!(
                server_addr = %self.server_addr,
                removed,
                "evicted unhealthy links"
            );
        }

        let deficit = self.config.size.saturating_sub(self.link_count());
        for _ in 0..deficit {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            match self.dial().await {
                Ok(link) => {
                    info!(link_id = %link.id(), "replaced unhealthy link");
                    self.insert(link);
                }
                Err(e) => {
                    warn!(error = %e, "failed to dial replacement link");
                    break;
                }
            }
        }
    }

    /// Stop the monitor and drop every link. Pending `acquire` calls fail
    /// with `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let handle = self.monitor.lock().ok().and_then(|mut m| m.take());
        if let Some(handle) = handle {
            handle.abort();
        }

        if let Ok(mut links) = self.links.write() {
            links.clear();
        }
        debug!(server_addr = %self.server_addr, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    fn test_config(size: usize) -> PoolConfig {
        PoolConfig {
            size,
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            health_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_connect_fills_pool() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((sock, _)) = listener.accept().await {
                    held.push(sock);
                }
            }
        });

        let pool = ConnectionPool::new(addr, TransportConfig::Tcp, test_config(3));
        pool.connect().await.unwrap();
        assert_eq!(pool.link_count(), 3);
        assert_eq!(pool.healthy_count(), 3);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_connect_fails_when_unreachable() {
        let (listener, addr) = listener().await;
        drop(listener);

        let pool = ConnectionPool::new(addr, TransportConfig::Tcp, test_config(2));
        assert!(pool.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_acquire_round_robin_skips_unhealthy() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((sock, _)) = listener.accept().await {
                    held.push(sock);
                }
            }
        });

        let pool = ConnectionPool::new(addr, TransportConfig::Tcp, test_config(3));
        pool.connect().await.unwrap();

        let bad = pool.acquire().unwrap();
        bad.mark_unhealthy();

        for _ in 0..10 {
            let link = pool.acquire().unwrap();
            assert!(link.is_healthy());
            assert_ne!(link.id(), bad.id());
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((sock, _)) = listener.accept().await {
                    held.push(sock);
                }
            }
        });

        let pool = ConnectionPool::new(addr, TransportConfig::Tcp, test_config(1));
        pool.connect().await.unwrap();
        pool.close().await;

        assert!(matches!(pool.acquire(), Err(AgentError::Closed)));
        assert_eq!(pool.link_count(), 0);
    }

    #[tokio::test]
    async fn test_monitor_replaces_dead_links() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            // Keep sockets open server-side.
            let mut held = Vec::new();
            loop {
                if let Ok((sock, _)) = listener.accept().await {
                    held.push(sock);
                }
            }
        });

        let pool = ConnectionPool::new(addr, TransportConfig::Tcp, test_config(2));
        pool.connect().await.unwrap();

        let victim = pool.acquire().unwrap();
        victim.mark_unhealthy();

        // Within a couple of monitor cycles the pool is back to full health.
        let mut restored = false;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if pool.healthy_count() == 2 {
                restored = true;
                break;
            }
        }
        assert!(restored, "pool did not recover to full size");
        pool.close().await;
    }
}
