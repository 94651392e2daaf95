//! Frame demultiplexer: the single reader on a tunnel's active link.
//!
//! Routes `DataForward` frames to the forwarder through a bounded queue
//! (backpressure propagates to the server through TCP flow control), matches
//! `Error`/`Acknowledge` frames to in-flight requests, and treats protocol
//! violations as fatal for the link that produced them.

use crate::forward::tcp::TcpForwarder;
use crate::link::{Link, LinkReader};
use dashmap::DashMap;
use portway_common::config::TunnelProtocol;
use portway_common::AgentError;
use portway_protocol::{DataForward, Frame, Payload};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

/// Why a long-lived tunnel task stopped. The lifecycle maps these to state
/// transitions instead of letting tasks panic or vanish silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    /// Peer half-closed the link.
    LinkClosed,
    /// Transport-level failure on the link.
    LinkError(String),
    /// Protocol violation; the offending link was marked unhealthy.
    Protocol(String),
    /// Heartbeat could not be delivered.
    HeartbeatFailed(String),
    /// The forward queue or its consumer went away.
    QueueClosed,
    /// Orderly shutdown was requested.
    Stopped,
}

impl std::fmt::Display for TaskExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskExit::LinkClosed => write!(f, "link closed by peer"),
            TaskExit::LinkError(e) => write!(f, "link error: {e}"),
            TaskExit::Protocol(e) => write!(f, "protocol error: {e}"),
            TaskExit::HeartbeatFailed(e) => write!(f, "heartbeat failed: {e}"),
            TaskExit::QueueClosed => write!(f, "forward queue closed"),
            TaskExit::Stopped => write!(f, "stopped"),
        }
    }
}

/// A `DataForward` accepted from the wire for which no `DataResponse` has
/// been emitted yet.
#[derive(Debug)]
pub struct InFlightRequest {
    pub request_id: String,
    pub connection_id: String,
    pub started_at: Instant,
    pub generation: u64,
    /// Fired when the request is canceled (server `Error`/`ConnectionClose`).
    pub cancel: Arc<Notify>,
}

/// request_id -> in-flight entry. Unique per tunnel at any instant.
pub type InFlightTable = Arc<DashMap<String, InFlightRequest>>;

pub struct Demultiplexer {
    pub tunnel_id: String,
    pub generation: u64,
    pub protocol: TunnelProtocol,
    pub reader: LinkReader,
    pub link: Arc<Link>,
    pub in_flight: InFlightTable,
    pub forward_tx: kanal::AsyncSender<Box<DataForward>>,
    /// Bridge map for raw TCP tunnels; `None` in HTTP mode.
    pub tcp: Option<Arc<TcpForwarder>>,
    pub shutdown: watch::Receiver<bool>,
}

impl Demultiplexer {
    pub async fn run(mut self) -> TaskExit {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.changed() => return TaskExit::Stopped,
                result = self.reader.recv() => match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        self.link.mark_unhealthy();
                        return TaskExit::LinkClosed;
                    }
                    Err(AgentError::Protocol(e)) => {
                        self.link.mark_unhealthy();
                        return TaskExit::Protocol(e.to_string());
                    }
                    Err(e) => {
                        self.link.mark_unhealthy();
                        return TaskExit::LinkError(e.to_string());
                    }
                },
            };

            if let Some(exit) = self.dispatch(frame).await {
                return exit;
            }
        }
    }

    /// Handle one frame in wire order. Returns `Some` to terminate the task.
    async fn dispatch(&mut self, frame: Frame) -> Option<TaskExit> {
        let payload = match frame.parse_payload() {
            Ok(payload) => payload,
            Err(e) => {
                // Undecodable payloads are fatal for this link only.
                warn!(
                    tunnel_id = %self.tunnel_id,
                    generation = self.generation,
                    error = %e,
                    "payload decode failed"
                );
                self.link.mark_unhealthy();
                return Some(TaskExit::Protocol(e.to_string()));
            }
        };

        match payload {
            Payload::DataForward(forward) => {
                trace!(
                    tunnel_id = %self.tunnel_id,
                    request_id = %forward.request_id,
                    connection_id = %forward.connection_id,
                    generation = self.generation,
                    method = %forward.method,
                    path = %forward.path,
                    "data forward received"
                );

                if self.protocol == TunnelProtocol::Http {
                    self.register_in_flight(&forward);
                }

                // Blocks when max_in_flight requests are queued, which stops
                // the link read loop and pushes back on the server.
                if self.forward_tx.send(forward).await.is_err() {
                    return Some(TaskExit::QueueClosed);
                }
            }
            Payload::DataResponse(response) => {
                // The server never legitimately sends these to the agent.
                warn!(
                    tunnel_id = %self.tunnel_id,
                    request_id = %response.request_id,
                    "unexpected DataResponse from server, dropping"
                );
            }
            Payload::Acknowledge(ack) => {
                let known = self.in_flight.contains_key(&ack.message_id);
                debug!(
                    tunnel_id = %self.tunnel_id,
                    message_id = %ack.message_id,
                    status = %ack.status,
                    matches_in_flight = known,
                    "acknowledge received"
                );
            }
            Payload::Error(err) => match err.request_id.as_deref() {
                Some(request_id) => {
                    if let Some((_, entry)) = self.in_flight.remove(request_id) {
                        entry.cancel.notify_waiters();
                        warn!(
                            tunnel_id = %self.tunnel_id,
                            request_id = %request_id,
                            code = %err.code,
                            message = %err.message,
                            "server error resolved in-flight request"
                        );
                    } else {
                        warn!(
                            tunnel_id = %self.tunnel_id,
                            request_id = %request_id,
                            code = %err.code,
                            "server error for unknown request"
                        );
                    }
                }
                None => {
                    warn!(
                        tunnel_id = %self.tunnel_id,
                        code = %err.code,
                        message = %err.message,
                        "server error without request id"
                    );
                }
            },
            Payload::Heartbeat(hb) => {
                debug!(
                    tunnel_id = %self.tunnel_id,
                    timestamp = hb.timestamp,
                    active_conns = hb.active_conns,
                    "server heartbeat"
                );
            }
            Payload::ConnectionClose(close) => {
                debug!(
                    tunnel_id = %self.tunnel_id,
                    connection_id = %close.connection_id,
                    reason = %close.reason,
                    "connection close received"
                );
                match &self.tcp {
                    Some(tcp) => {
                        tcp.close_bridge(&close.connection_id, &close.reason, false, true)
                            .await;
                    }
                    None => self.cancel_connection(&close.connection_id),
                }
            }
            Payload::TunnelRegistration(_) => {
                warn!(
                    tunnel_id = %self.tunnel_id,
                    "unexpected TunnelRegistration from server, dropping"
                );
            }
        }

        None
    }

    /// Insert an in-flight entry, evicting any earlier request that reused
    /// the id (a server-side invariant violation).
    fn register_in_flight(&self, forward: &DataForward) {
        let entry = InFlightRequest {
            request_id: forward.request_id.clone(),
            connection_id: forward.connection_id.clone(),
            started_at: Instant::now(),
            generation: self.generation,
            cancel: Arc::new(Notify::new()),
        };
        if let Some(evicted) = self.in_flight.insert(forward.request_id.clone(), entry) {
            warn!(
                tunnel_id = %self.tunnel_id,
                request_id = %evicted.request_id,
                "duplicate request id from server, evicting earlier entry"
            );
            evicted.cancel.notify_waiters();
        }
    }

    /// Cancel every in-flight request belonging to one server connection.
    fn cancel_connection(&self, connection_id: &str) {
        let ids: Vec<String> = self
            .in_flight
            .iter()
            .filter(|e| e.connection_id == connection_id)
            .map(|e| e.request_id.clone())
            .collect();
        for id in ids {
            if let Some((_, entry)) = self.in_flight.remove(&id) {
                entry.cancel.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::DEFAULT_WRITE_TIMEOUT;
    use bytes::Bytes;
    use portway_protocol::{DataResponse, WireError};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::duplex;

    struct Harness {
        server: Arc<Link>,
        in_flight: InFlightTable,
        forward_rx: kanal::AsyncReceiver<Box<DataForward>>,
        shutdown_tx: watch::Sender<bool>,
        task: tokio::task::JoinHandle<TaskExit>,
    }

    async fn spawn_demux(queue_capacity: usize) -> Harness {
        let (client_side, server_side) = duplex(256 * 1024);
        let client = Arc::new(Link::new(Box::pin(client_side), DEFAULT_WRITE_TIMEOUT));
        let server = Arc::new(Link::new(Box::pin(server_side), DEFAULT_WRITE_TIMEOUT));

        let reader = client.take_reader(None).await.unwrap();
        let in_flight: InFlightTable = Arc::new(DashMap::new());
        let (forward_tx, forward_rx) = kanal::bounded_async(queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let demux = Demultiplexer {
            tunnel_id: "tun_demux".into(),
            generation: 1,
            protocol: TunnelProtocol::Http,
            reader,
            link: Arc::clone(&client),
            in_flight: Arc::clone(&in_flight),
            forward_tx,
            tcp: None,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(demux.run());

        Harness {
            server,
            in_flight,
            forward_rx,
            shutdown_tx,
            task,
        }
    }

    fn forward(request_id: &str, connection_id: &str) -> DataForward {
        DataForward {
            connection_id: connection_id.into(),
            request_id: request_id.into(),
            data: Bytes::new(),
            headers: HashMap::new(),
            method: "GET".into(),
            path: "/".into(),
        }
    }

    #[tokio::test]
    async fn test_data_forward_registers_and_enqueues() {
        let harness = spawn_demux(4).await;

        let frame = forward("req-1", "conn-1").into_frame("tun_demux").unwrap();
        harness.server.send(frame).await.unwrap();

        let job = harness.forward_rx.recv().await.unwrap();
        assert_eq!(job.request_id, "req-1");
        assert!(harness.in_flight.contains_key("req-1"));

        let _ = harness.shutdown_tx.send(true);
        assert_eq!(harness.task.await.unwrap(), TaskExit::Stopped);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_evicts_earlier_entry() {
        let harness = spawn_demux(4).await;

        for _ in 0..2 {
            let frame = forward("req-dup", "conn-1").into_frame("tun_demux").unwrap();
            harness.server.send(frame).await.unwrap();
        }

        let _ = harness.forward_rx.recv().await.unwrap();
        let _ = harness.forward_rx.recv().await.unwrap();
        // Exactly one live entry for the id.
        assert_eq!(harness.in_flight.len(), 1);

        let _ = harness.shutdown_tx.send(true);
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn test_server_error_resolves_in_flight() {
        let harness = spawn_demux(4).await;

        let frame = forward("req-err", "conn-1").into_frame("tun_demux").unwrap();
        harness.server.send(frame).await.unwrap();
        let _ = harness.forward_rx.recv().await.unwrap();

        let err = WireError {
            code: "UPSTREAM_TIMEOUT".into(),
            message: "gateway timed out".into(),
            details: None,
            request_id: Some("req-err".into()),
        };
        harness
            .server
            .send(err.into_frame("tun_demux").unwrap())
            .await
            .unwrap();

        // The demux loop processes frames in order, so poll until applied.
        for _ in 0..50 {
            if !harness.in_flight.contains_key("req-err") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!harness.in_flight.contains_key("req-err"));

        let _ = harness.shutdown_tx.send(true);
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn test_unexpected_data_response_is_dropped() {
        let harness = spawn_demux(4).await;

        let response = DataResponse {
            connection_id: "conn-x".into(),
            request_id: "req-x".into(),
            data: Bytes::new(),
            status_code: 200,
            headers: HashMap::new(),
        };
        harness
            .server
            .send(response.into_frame("tun_demux").unwrap())
            .await
            .unwrap();

        // Still running and nothing registered.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.in_flight.is_empty());
        assert!(!harness.task.is_finished());

        let _ = harness.shutdown_tx.send(true);
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_fatal_for_link() {
        let harness = spawn_demux(4).await;

        let bogus = Frame::new(
            portway_protocol::MessageKind::DataForward,
            "tun_demux",
            Bytes::from_static(b"not json at all"),
        );
        harness.server.send(bogus).await.unwrap();

        let exit = harness.task.await.unwrap();
        assert!(matches!(exit, TaskExit::Protocol(_)));
    }

    #[tokio::test]
    async fn test_peer_close_exits_with_link_closed() {
        let harness = spawn_demux(4).await;
        drop(harness.server);
        let exit = harness.task.await.unwrap();
        assert_eq!(exit, TaskExit::LinkClosed);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_without_dropping() {
        let harness = spawn_demux(2).await;

        for i in 0..3 {
            let frame = forward(&format!("req-{i}"), "conn-1")
                .into_frame("tun_demux")
                .unwrap();
            harness.server.send(frame).await.unwrap();
        }

        // With capacity 2 and no consumer, the third enqueue must block the
        // demux loop rather than drop the frame.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!harness.task.is_finished());

        // Draining the queue releases all three, in order.
        for i in 0..3 {
            let job = harness.forward_rx.recv().await.unwrap();
            assert_eq!(job.request_id, format!("req-{i}"));
        }

        let _ = harness.shutdown_tx.send(true);
        let _ = harness.task.await;
    }
}
