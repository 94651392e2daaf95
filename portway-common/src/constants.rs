//! Default ports, sizes and intervals for the Portway agent.
//!
//! Use these constants instead of magic numbers so defaults stay consistent
//! across the agent library, the CLI and the tests.

/// Default control-plane HTTPS port.
pub const DEFAULT_API_PORT: u16 = 443;

/// Default data-plane TLS port.
pub const DEFAULT_DATA_PLANE_PORT: u16 = 7223;

/// Default number of links per tunnel pool.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Default heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Default base reconnect interval in seconds.
pub const DEFAULT_RECONNECT_SECS: u64 = 5;

/// Cap on the exponential reconnect delay in seconds.
pub const MAX_RECONNECT_DELAY_SECS: u64 = 60;

/// Default maximum reconnect attempts before a tunnel goes terminal.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Default dial + TLS handshake budget in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Default bound on concurrent in-flight forwarded requests per tunnel.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 100;

/// Per-request timeout against the local HTTP service, seconds.
pub const LOCAL_HTTP_TIMEOUT_SECS: u64 = 30;

/// Dial timeout for local TCP bridges, seconds.
pub const LOCAL_TCP_DIAL_TIMEOUT_SECS: u64 = 10;

/// Idle timeout for local TCP bridge reads, seconds.
pub const LOCAL_TCP_IDLE_TIMEOUT_SECS: u64 = 30;

/// Pool health-check cycle, seconds.
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// Deadline for one health-probe read, seconds.
pub const HEALTH_PROBE_TIMEOUT_SECS: u64 = 5;

/// How long `stop()` waits for child tasks before abandoning them, seconds.
pub const STOP_GRACE_SECS: u64 = 30;

/// Default port for the local status snapshot endpoint.
pub const DEFAULT_STATUS_PORT: u16 = 4040;
