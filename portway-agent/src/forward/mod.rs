//! Local-service forwarding.
//!
//! The [`Forwarder`] consumes the demultiplexer's bounded queue and executes
//! each `DataForward` against the configured local service, with concurrency
//! capped at `max_in_flight`. HTTP tunnels use [`http::HttpForwarder`], raw
//! TCP tunnels use [`tcp::TcpForwarder`].

pub mod http;
pub mod tcp;

use crate::demux::{InFlightTable, TaskExit};
use crate::outbound::Outbound;
use crate::stats::TunnelCounters;
use http::HttpForwarder;
use portway_common::config::TunnelProtocol;
use portway_protocol::DataForward;
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

pub struct Forwarder {
    pub protocol: TunnelProtocol,
    pub queue: kanal::AsyncReceiver<Box<DataForward>>,
    /// Caps concurrent request execution at `max_in_flight`.
    pub semaphore: Arc<Semaphore>,
    pub http: Option<Arc<HttpForwarder>>,
    pub tcp: Option<Arc<tcp::TcpForwarder>>,
    pub in_flight: InFlightTable,
    pub outbound: Arc<Outbound>,
    pub counters: Arc<TunnelCounters>,
    pub shutdown: watch::Receiver<bool>,
}

impl Forwarder {
    pub async fn run(mut self) -> TaskExit {
        loop {
            let job = tokio::select! {
                _ = self.shutdown.changed() => return TaskExit::Stopped,
                job = self.queue.recv() => match job {
                    Ok(job) => job,
                    Err(_) => return TaskExit::QueueClosed,
                },
            };

            self.counters.request_started();

            match self.protocol {
                TunnelProtocol::Tcp => {
                    if let Some(tcp) = &self.tcp {
                        tcp.handle_forward(job).await;
                    }
                }
                TunnelProtocol::Http => {
                    // Holding the queue back until a permit frees is what
                    // turns max_in_flight into backpressure on the link.
                    let permit = tokio::select! {
                        _ = self.shutdown.changed() => return TaskExit::Stopped,
                        permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return TaskExit::QueueClosed,
                        },
                    };
                    let Some(http) = self.http.as_ref().map(Arc::clone) else {
                        error!("http forwarder missing for http tunnel");
                        return TaskExit::QueueClosed;
                    };
                    tokio::spawn(run_http_job(
                        job,
                        http,
                        Arc::clone(&self.in_flight),
                        Arc::clone(&self.outbound),
                        Arc::clone(&self.counters),
                        permit,
                    ));
                }
            }
        }
    }
}

/// Execute one HTTP request end to end.
///
/// The in-flight entry is removed before the response frame is written, so
/// at most one `DataResponse` ever leaves the agent for a given request id,
/// no matter how the request ends.
async fn run_http_job(
    job: Box<DataForward>,
    http: Arc<HttpForwarder>,
    in_flight: InFlightTable,
    outbound: Arc<Outbound>,
    counters: Arc<TunnelCounters>,
    permit: OwnedSemaphorePermit,
) {
    // Entry may already be gone if the server canceled before we started.
    let Some(cancel) = in_flight
        .get(&job.request_id)
        .map(|entry| Arc::clone(&entry.cancel))
    else {
        debug!(request_id = %job.request_id, "request canceled before execution");
        return;
    };

    counters.conn_opened();
    let response = tokio::select! {
        response = http.handle(&job) => Some(response),
        _ = cancel.notified() => None,
    };
    counters.conn_closed();

    match response {
        Some(response) => {
            if in_flight.remove(&job.request_id).is_none() {
                // Resolved elsewhere (cancel or duplicate eviction); the
                // response must not be emitted twice.
                debug!(request_id = %job.request_id, "in-flight entry already resolved");
                return;
            }
            match response.into_frame(outbound.tunnel_id()) {
                Ok(frame) => {
                    if let Err(e) = outbound.send(frame).await {
                        warn!(
                            request_id = %job.request_id,
                            error = %e,
                            "failed to send response frame"
                        );
                    }
                }
                Err(e) => error!(request_id = %job.request_id, error = %e, "response encode failed"),
            }
        }
        None => debug!(request_id = %job.request_id, "request canceled mid-flight"),
    }

    drop(permit);
}
