//! Generation-stamped outbound frame path.
//!
//! Every task spawned for a tunnel incarnation sends through an [`Outbound`]
//! stamped with the generation it was spawned at. After a reconnect bumps
//! the tunnel's generation, frames from tasks of the old incarnation are
//! dropped here instead of being written to the new links.

use crate::pool::ConnectionPool;
use portway_common::Result;
use portway_protocol::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct Outbound {
    tunnel_id: String,
    pool: Arc<ConnectionPool>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
    stale_drops: AtomicU64,
}

impl Outbound {
    /// Stamp a new sender with the tunnel's current generation.
    pub fn new(
        tunnel_id: String,
        pool: Arc<ConnectionPool>,
        current_generation: Arc<AtomicU64>,
    ) -> Arc<Self> {
        let generation = current_generation.load(Ordering::Acquire);
        Arc::new(Self {
            tunnel_id,
            pool,
            current_generation,
            generation,
            stale_drops: AtomicU64::new(0),
        })
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Send a frame on a healthy pool link, unless this sender's generation
    /// is stale, in which case the frame is silently discarded.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let current = self.current_generation.load(Ordering::Acquire);
        if current != self.generation {
            self.stale_drops.fetch_add(1, Ordering::Relaxed);
            debug!(
                tunnel_id = %self.tunnel_id,
                generation = self.generation,
                current_generation = current,
                kind = %frame.kind,
                "dropping frame from stale generation"
            );
            return Ok(());
        }

        let link = self.pool.acquire()?;
        link.send(frame).await
    }

    /// Frames discarded because this sender outlived its generation.
    pub fn stale_drops(&self) -> u64 {
        self.stale_drops.load(Ordering::Relaxed)
    }
}
