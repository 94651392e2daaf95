//! Per-tunnel runtime counters, shared between the forwarders and the
//! heartbeat task.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TunnelCounters {
    active_conns: AtomicU64,
    total_requests: AtomicU64,
}

impl TunnelCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conn_opened(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_closed(&self) {
        // Saturating: a double-close must not wrap the gauge.
        let _ = self
            .active_conns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn request_started(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_conns(&self) -> u64 {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = TunnelCounters::new();
        counters.conn_opened();
        counters.conn_opened();
        counters.conn_closed();
        counters.request_started();
        assert_eq!(counters.active_conns(), 1);
        assert_eq!(counters.total_requests(), 1);
    }

    #[test]
    fn test_close_does_not_underflow() {
        let counters = TunnelCounters::new();
        counters.conn_closed();
        assert_eq!(counters.active_conns(), 0);
    }
}
