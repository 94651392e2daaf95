//! Raw TCP bridges.
//!
//! For TCP tunnels the request/response model is replaced by a per
//! `connection_id` duplex binding to the local service: server bytes arrive
//! as `DataForward` frames and are written to the local socket; local bytes
//! are read back and wrapped in `DataResponse` frames with the same
//! `connection_id`.

use crate::outbound::Outbound;
use crate::stats::TunnelCounters;
use bytes::Bytes;
use dashmap::DashMap;
use portway_common::constants::{LOCAL_TCP_DIAL_TIMEOUT_SECS, LOCAL_TCP_IDLE_TIMEOUT_SECS};
use portway_protocol::{ConnectionClose, DataForward, DataResponse};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

const BRIDGE_WRITE_QUEUE: usize = 64;
const READ_BUFFER_SIZE: usize = 4096;

/// One live binding between a server connection id and a local socket.
struct TcpBridge {
    connection_id: String,
    /// Request id of the `DataForward` that opened the bridge; echoed on
    /// every outbound `DataResponse`.
    request_id: String,
    to_local: mpsc::Sender<Bytes>,
    created_at: Instant,
    last_activity: std::sync::Mutex<Instant>,
    reader_task: JoinHandle<()>,
}

pub struct TcpForwarder {
    tunnel_id: String,
    local_addr: String,
    bridges: DashMap<String, TcpBridge>,
    outbound: Arc<Outbound>,
    counters: Arc<TunnelCounters>,
    dial_timeout: Duration,
    idle_timeout: Duration,
}

impl TcpForwarder {
    pub fn new(
        tunnel_id: String,
        local_port: u16,
        outbound: Arc<Outbound>,
        counters: Arc<TunnelCounters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tunnel_id,
            local_addr: format!("127.0.0.1:{local_port}"),
            bridges: DashMap::new(),
            outbound,
            counters,
            dial_timeout: Duration::from_secs(LOCAL_TCP_DIAL_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(LOCAL_TCP_IDLE_TIMEOUT_SECS),
        })
    }

    pub fn bridge_count(&self) -> usize {
        self.bridges.len()
    }

    /// Route one `DataForward`: first frame for a connection id dials the
    /// local service and opens a bridge; later frames enqueue bytes to it.
    pub async fn handle_forward(self: &Arc<Self>, forward: Box<DataForward>) {
        let connection_id = forward.connection_id.clone();

        let existing = self.bridges.get(&connection_id).map(|bridge| {
            if let Ok(mut last) = bridge.last_activity.lock() {
                *last = Instant::now();
            }
            bridge.to_local.clone()
        });

        let to_local = match existing {
            Some(sender) => sender,
            None => match self.open_bridge(&forward).await {
                Some(sender) => sender,
                None => return,
            },
        };

        if forward.data.is_empty() {
            return;
        }
        if to_local.send(forward.data.clone()).await.is_err() {
            self.close_bridge(&connection_id, "local writer gone", true, true)
                .await;
        }
    }

    async fn open_bridge(self: &Arc<Self>, forward: &DataForward) -> Option<mpsc::Sender<Bytes>> {
        let connection_id = forward.connection_id.clone();

        let stream = match timeout(self.dial_timeout, TcpStream::connect(&self.local_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(
                    tunnel_id = %self.tunnel_id,
                    connection_id = %connection_id,
                    local_addr = %self.local_addr,
                    error = %e,
                    "failed to connect to local service"
                );
                self.notify_close(&connection_id, "failed to connect to local service")
                    .await;
                return None;
            }
            Err(_) => {
                warn!(
                    tunnel_id = %self.tunnel_id,
                    connection_id = %connection_id,
                    local_addr = %self.local_addr,
                    "local dial timed out"
                );
                self.notify_close(&connection_id, "local dial timed out").await;
                return None;
            }
        };
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (to_local, from_server) = mpsc::channel::<Bytes>(BRIDGE_WRITE_QUEUE);
        let writer_task = tokio::spawn(write_local(write_half, from_server));

        let reader_task = tokio::spawn(Arc::clone(self).read_local(
            read_half,
            connection_id.clone(),
            forward.request_id.clone(),
        ));
        // Writer lifetime is tied to the channel: dropping the bridge drops
        // the only sender and the writer drains and exits.
        drop(writer_task);

        let now = Instant::now();
        let bridge = TcpBridge {
            connection_id: connection_id.clone(),
            request_id: forward.request_id.clone(),
            to_local: to_local.clone(),
            created_at: now,
            last_activity: std::sync::Mutex::new(now),
            reader_task,
        };
        self.bridges.insert(connection_id.clone(), bridge);
        self.counters.conn_opened();

        debug!(
            tunnel_id = %self.tunnel_id,
            connection_id = %connection_id,
            local_addr = %self.local_addr,
            "tcp bridge established"
        );
        Some(to_local)
    }

    /// Local -> remote pump. Runs until EOF, a read error, the idle timeout,
    /// or an external close aborts it.
    async fn read_local(
        self: Arc<Self>,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        connection_id: String,
        request_id: String,
    ) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let (reason, notify_server) =
                match timeout(self.idle_timeout, read_half.read(&mut buf)).await {
                    Ok(Ok(0)) => ("local service closed connection", true),
                    Ok(Ok(n)) => {
                        if let Some(bridge) = self.bridges.get(&connection_id) {
                            if let Ok(mut last) = bridge.last_activity.lock() {
                                *last = Instant::now();
                            }
                        }
                        let response = DataResponse {
                            connection_id: connection_id.clone(),
                            request_id: request_id.clone(),
                            data: Bytes::copy_from_slice(&buf[..n]),
                            status_code: 200,
                            headers: HashMap::new(),
                        };
                        match response.into_frame(self.tunnel_id.as_str()) {
                            Ok(frame) => match self.outbound.send(frame).await {
                                Ok(()) => continue,
                                Err(e) => {
                                    warn!(
                                        tunnel_id = %self.tunnel_id,
                                        connection_id = %connection_id,
                                        error = %e,
                                        "failed to send bridge data upstream"
                                    );
                                    ("link send failed", false)
                                }
                            },
                            Err(e) => {
                                warn!(error = %e, "bridge response encode failed");
                                ("encode failed", false)
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        debug!(
                            connection_id = %connection_id,
                            error = %e,
                            "bridge read error"
                        );
                        ("local read error", true)
                    }
                    Err(_) => ("idle timeout", true),
                };

            // Do not abort the reader task here: this IS the reader task.
            self.close_bridge(&connection_id, reason, notify_server, false)
                .await;
            return;
        }
    }

    /// Tear down one bridge. `notify_server` sends a `ConnectionClose` frame
    /// upstream; `abort_reader` cancels the local read pump (must be false
    /// when called from the pump itself).
    pub async fn close_bridge(
        &self,
        connection_id: &str,
        reason: &str,
        notify_server: bool,
        abort_reader: bool,
    ) {
        let Some((_, bridge)) = self.bridges.remove(connection_id) else {
            return;
        };
        self.counters.conn_closed();

        let idle_secs = bridge
            .last_activity
            .lock()
            .map(|last| last.elapsed().as_secs())
            .unwrap_or(0);
        debug!(
            tunnel_id = %self.tunnel_id,
            connection_id = %bridge.connection_id,
            request_id = %bridge.request_id,
            reason,
            age_secs = bridge.created_at.elapsed().as_secs(),
            idle_secs,
            "tcp bridge closed"
        );

        if abort_reader {
            bridge.reader_task.abort();
        }
        // Dropping `bridge` drops `to_local`, which stops the writer and
        // closes the local socket's write side.
        drop(bridge);

        if notify_server {
            self.notify_close(connection_id, reason).await;
        }
    }

    /// Close every bridge (tunnel drain or shutdown).
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.bridges.iter().map(|b| b.connection_id.clone()).collect();
        for id in ids {
            self.close_bridge(&id, "tunnel shutdown", false, true).await;
        }
    }

    async fn notify_close(&self, connection_id: &str, reason: &str) {
        let close = ConnectionClose {
            connection_id: connection_id.to_string(),
            reason: reason.to_string(),
        };
        match close.into_frame(self.tunnel_id.as_str()) {
            Ok(frame) => {
                if let Err(e) = self.outbound.send(frame).await {
                    debug!(
                        tunnel_id = %self.tunnel_id,
                        connection_id = %connection_id,
                        error = %e,
                        "failed to notify server of bridge close"
                    );
                }
            }
            Err(e) => debug!(error = %e, "connection close encode failed"),
        }
    }
}

async fn write_local(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut from_server: mpsc::Receiver<Bytes>,
) {
    while let Some(chunk) = from_server.recv().await {
        if write_half.write_all(&chunk).await.is_err() {
            return;
        }
    }
    let _ = write_half.shutdown().await;
}
