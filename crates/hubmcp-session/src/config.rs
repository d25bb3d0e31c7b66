//! Configuration the session layer needs, independent of the gateway
//! binary's full `GatewayConfig` (§3.1) so this crate stays below it in the
//! workspace dependency graph.

use std::time::Duration;

/// The subset of `GatewayConfig` the [`crate::manager::SessionManager`] and
/// [`crate::janitor::Janitor`] consume.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Idle-eviction threshold (`MCP_SESSION_TIMEOUT_MINUTES`, default 30 min).
    pub idle_timeout: Duration,
    /// Janitor tick period (`MCP_SESSION_CLEANUP_INTERVAL_MINUTES`, default 5 min).
    pub cleanup_interval: Duration,
    /// Stdio/SSE frame-size cap (`MCP_MAX_FRAME_BYTES`, default 4 MiB).
    pub max_frame_bytes: usize,
    /// Default `timeout_ms` for a `BackendServer` lacking one (`MCP_DEFAULT_TIMEOUT_MS`).
    pub default_timeout_ms: u64,
    /// Grace period `evict` waits for `inflight_count == 0` before forcing a drain.
    pub evict_grace: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            max_frame_bytes: hubmcp_transport::DEFAULT_MAX_FRAME_BYTES,
            default_timeout_ms: 30_000,
            evict_grace: Duration::from_secs(5),
        }
    }
}
