//! `GatewayConfig` (§3.1): a typed, immutable configuration snapshot built
//! once at startup from the environment variables of §6, layered over
//! `std::env` with the `config` crate so unset keys fall back to documented
//! defaults rather than erroring.

use std::net::SocketAddr;
use std::time::Duration;

use hubmcp_session::SessionManagerConfig;
use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read environment: {0}")]
    Source(#[from] config::ConfigError),

    #[error("{key} is not a valid {expected}: {value}")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
}

/// Process-wide configuration snapshot. Constructed once in `main`,
/// immutable thereafter, cheaply cloned (`Arc`-wrapped by callers) into
/// every component that needs it, per the initialization order in §9.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub encryption_key_b64: String,
    /// Passed through verbatim to the external auth collaborator; the core
    /// never verifies a JWT itself.
    pub auth_secret: Option<String>,
    pub outbound_queue_capacity: usize,
    pub session: SessionManagerConfig,
}

impl GatewayConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `MCP_ENCRYPTION_KEY` or
    /// `DATABASE_URL` are unset, or [`ConfigError::Invalid`] if a numeric or
    /// socket-address field fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Layer the raw environment through `config` so every lookup funnels
        // through one source even though each field still needs its own
        // typed parse (durations, a socket address) that a blanket
        // deserialize can't express.
        let source = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let encryption_key_b64 = source
            .get_string("MCP_ENCRYPTION_KEY")
            .map_err(|_| ConfigError::Missing("MCP_ENCRYPTION_KEY"))?;
        let database_url = source
            .get_string("DATABASE_URL")
            .map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let auth_secret = source.get_string("AUTH_SECRET").ok();

        let bind_addr = parse_or_default(
            &source,
            "MCP_BIND_ADDR",
            DEFAULT_BIND_ADDR,
            "MCP_BIND_ADDR",
            "socket address",
        )?;

        let idle_timeout_minutes: u64 = parse_number_or(
            &source,
            "MCP_SESSION_TIMEOUT_MINUTES",
            30,
            "MCP_SESSION_TIMEOUT_MINUTES",
        )?;
        let cleanup_interval_minutes: u64 = parse_number_or(
            &source,
            "MCP_SESSION_CLEANUP_INTERVAL_MINUTES",
            5,
            "MCP_SESSION_CLEANUP_INTERVAL_MINUTES",
        )?;
        let default_timeout_ms: u64 = parse_number_or(
            &source,
            "MCP_DEFAULT_TIMEOUT_MS",
            30_000,
            "MCP_DEFAULT_TIMEOUT_MS",
        )?;
        let max_frame_bytes: usize = parse_number_or(
            &source,
            "MCP_MAX_FRAME_BYTES",
            hubmcp_transport::DEFAULT_MAX_FRAME_BYTES as u64,
            "MCP_MAX_FRAME_BYTES",
        )? as usize;
        let outbound_queue_capacity: usize = parse_number_or(
            &source,
            "MCP_OUTBOUND_QUEUE_CAPACITY",
            DEFAULT_OUTBOUND_QUEUE_CAPACITY as u64,
            "MCP_OUTBOUND_QUEUE_CAPACITY",
        )? as usize;

        Ok(Self {
            bind_addr,
            database_url,
            encryption_key_b64,
            auth_secret,
            outbound_queue_capacity,
            session: SessionManagerConfig {
                idle_timeout: Duration::from_secs(idle_timeout_minutes * 60),
                cleanup_interval: Duration::from_secs(cleanup_interval_minutes * 60),
                max_frame_bytes,
                default_timeout_ms,
                evict_grace: Duration::from_secs(5),
            },
        })
    }
}

fn parse_number_or(
    source: &config::Config,
    key: &'static str,
    default: u64,
    name: &'static str,
) -> Result<u64, ConfigError> {
    match source.get_string(key) {
        Ok(raw) => raw.parse::<u64>().map_err(|_| ConfigError::Invalid {
            key: name,
            expected: "integer",
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

fn parse_or_default(
    source: &config::Config,
    key: &'static str,
    default: &str,
    name: &'static str,
    expected: &'static str,
) -> Result<SocketAddr, ConfigError> {
    let raw = source.get_string(key).unwrap_or_else(|_| default.to_string());
    raw.parse::<SocketAddr>()
        .map_err(|_| ConfigError::Invalid {
            key: name,
            expected,
            value: raw,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_number_or_falls_back_to_default() {
        let source = config::Config::builder().build().unwrap();
        let value = parse_number_or(&source, "MCP_DOES_NOT_EXIST", 42, "MCP_DOES_NOT_EXIST").unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_or_default_falls_back_to_bind_addr_default() {
        let source = config::Config::builder().build().unwrap();
        let addr = parse_or_default(
            &source,
            "MCP_BIND_ADDR",
            DEFAULT_BIND_ADDR,
            "MCP_BIND_ADDR",
            "socket address",
        )
        .unwrap();
        assert_eq!(addr.port(), 8080);
    }
}
