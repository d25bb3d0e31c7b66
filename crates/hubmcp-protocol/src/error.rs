//! Gateway-wide error taxonomy.
//!
//! Every public operation in every crate of this workspace returns through
//! [`GatewayError`] so the SSE bridge can map a failure to the JSON-RPC error
//! code and HTTP status the external client sees without re-deriving the
//! mapping at each call site.

use thiserror::Error;

/// The gateway's error taxonomy, non-exhaustive so new variants can be added
/// without a breaking change for downstream matchers that use a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// No `BackendServer` row matches the given project/ref.
    #[error("backend server not found: {0}")]
    NotFound(String),

    /// An external auth collaborator rejected the caller.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The backend handshake (`initialize`/`initialized`) failed or timed out.
    #[error("backend initialization failed: {0}")]
    InitError(String),

    /// The session's transport failed mid-flight; the session was removed.
    #[error("transport gone: {0}")]
    TransportGone(String),

    /// A deadline derived from `timeout_ms` expired.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A client channel's outbound queue was full.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// Ciphertext failed to authenticate, or the configured key doesn't match.
    #[error("decryption failed")]
    DecryptError,

    /// The client channel this request targeted is closing or closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// A request referenced a malformed or unparseable message.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Anything else, generally a bug surface rather than a runtime condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether retrying the same request might succeed without intervention.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportGone(_) | Self::Timeout(_) | Self::Backpressure(_)
        )
    }

    /// The JSON-RPC error code this variant is surfaced as on the client's
    /// SSE channel, per the gateway's error taxonomy.
    #[must_use]
    pub const fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::NotFound(_) => -32001,
            Self::InitError(_) => -32002,
            Self::TransportGone(_) => -32003,
            Self::Timeout(_) => -32004,
            Self::DecryptError => -32005,
            Self::Unauthorized(_) => -32006,
            Self::Backpressure(_) => -32007,
            Self::ChannelClosed(_) => -32008,
            Self::BadRequest(_) => -32600,
            Self::Internal(_) => -32603,
        }
    }

    /// The HTTP status returned from the Bridge's POST endpoint for this
    /// error, when it surfaces before the message is accepted for routing.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::NotFound(_) => 404,
            Self::ChannelClosed(_) => 409,
            Self::Backpressure(_) => 503,
            Self::InitError(_)
            | Self::TransportGone(_)
            | Self::Timeout(_)
            | Self::DecryptError
            | Self::Internal(_) => 500,
        }
    }

    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    #[must_use]
    pub fn init_error(what: impl Into<String>) -> Self {
        Self::InitError(what.into())
    }

    #[must_use]
    pub fn transport_gone(what: impl Into<String>) -> Self {
        Self::TransportGone(what.into())
    }

    #[must_use]
    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout(what.into())
    }

    #[must_use]
    pub fn internal(what: impl Into<String>) -> Self {
        Self::Internal(what.into())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(GatewayError::not_found("x").jsonrpc_code(), -32001);
        assert_eq!(GatewayError::init_error("x").jsonrpc_code(), -32002);
        assert_eq!(GatewayError::transport_gone("x").jsonrpc_code(), -32003);
        assert_eq!(GatewayError::timeout("x").jsonrpc_code(), -32004);
        assert_eq!(GatewayError::DecryptError.jsonrpc_code(), -32005);
    }

    #[test]
    fn retryable_set_matches_spec() {
        assert!(GatewayError::transport_gone("x").is_retryable());
        assert!(GatewayError::timeout("x").is_retryable());
        assert!(GatewayError::Backpressure("full".into()).is_retryable());
        assert!(!GatewayError::not_found("x").is_retryable());
        assert!(!GatewayError::DecryptError.is_retryable());
    }

    #[test]
    fn http_statuses_match_spec() {
        assert_eq!(GatewayError::Unauthorized("x".into()).http_status(), 401);
        assert_eq!(GatewayError::Backpressure("x".into()).http_status(), 503);
        assert_eq!(GatewayError::not_found("x").http_status(), 404);
        assert_eq!(GatewayError::ChannelClosed("x".into()).http_status(), 409);
    }
}
