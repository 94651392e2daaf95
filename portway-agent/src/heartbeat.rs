//! Per-tunnel heartbeat task.
//!
//! Fire-and-forget: no acknowledgment is expected. A send failure ends the
//! task and the lifecycle treats that as a link failure.

use crate::demux::TaskExit;
use crate::outbound::Outbound;
use crate::stats::TunnelCounters;
use portway_protocol::Heartbeat;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct HeartbeatTask {
    pub tunnel_id: String,
    pub outbound: Arc<Outbound>,
    pub counters: Arc<TunnelCounters>,
    pub interval: Duration,
    pub shutdown: watch::Receiver<bool>,
}

impl HeartbeatTask {
    pub async fn run(mut self) -> TaskExit {
        // Skip the immediate first tick; the first beat goes out one full
        // interval after activation.
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return TaskExit::Stopped,
                _ = ticker.tick() => {
                    if let Err(exit) = self.beat().await {
                        return exit;
                    }
                }
            }
        }
    }

    async fn beat(&self) -> Result<(), TaskExit> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        let heartbeat = Heartbeat {
            timestamp,
            active_conns: self.counters.active_conns(),
            total_requests: self.counters.total_requests(),
        };

        debug!(
            tunnel_id = %self.tunnel_id,
            generation = self.outbound.generation(),
            active_conns = heartbeat.active_conns,
            total_requests = heartbeat.total_requests,
            "sending heartbeat"
        );

        let frame = heartbeat
            .into_frame(self.tunnel_id.as_str())
            .map_err(|e| TaskExit::HeartbeatFailed(e.to_string()))?;
        self.outbound.send(frame).await.map_err(|e| {
            warn!(tunnel_id = %self.tunnel_id, error = %e, "heartbeat send failed");
            TaskExit::HeartbeatFailed(e.to_string())
        })
    }
}
