//! The uniform operation set every transport exposes, and the sealed
//! `AnyTransport` enum the session manager actually holds.

use async_trait::async_trait;
use hubmcp_protocol::JsonRpcMessage;

use crate::core::{TransportError, TransportKind, TransportState};
use crate::sse_client::SseClientTransport;
use crate::stdio::StdioTransport;

/// Operations common to every transport kind. Implementers run their own
/// background reader task; `recv_frame` simply drains the channel it feeds.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one JSON-RPC request or notification. Serializes writers
    /// internally; safe to call concurrently, writes never interleave.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the transport is not `Ready`/
    /// `Initializing`, or if the underlying write fails.
    async fn send_frame(&self, msg: &JsonRpcMessage) -> Result<(), TransportError>;

    /// Await the next inbound frame (a response or a server-initiated
    /// notification). Returns `Ok(None)` on clean EOF.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Decode`] if a frame fails to parse, or
    /// [`TransportError::FrameTooLarge`] if it exceeds the configured cap;
    /// both transition the transport to `Dead`.
    async fn recv_frame(&self) -> Result<Option<JsonRpcMessage>, TransportError>;

    /// Run the MCP `initialize`/`initialized` handshake. Only after this
    /// returns `Ok` is the transport `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::HandshakeTimeout`] or
    /// [`TransportError::HandshakeRejected`] on failure; the transport is
    /// left `Dead` in either case, matching §4.3's "never cached" rule.
    async fn initialize(
        &self,
        client_info: serde_json::Value,
        timeout: std::time::Duration,
    ) -> Result<serde_json::Value, TransportError>;

    /// Drain: attempt a graceful shutdown handshake, then escalate to a
    /// forced kill if the backend doesn't cooperate within grace periods.
    async fn drain(&self);

    fn state(&self) -> TransportState;

    fn kind(&self) -> TransportKind;
}

/// The sealed variant over concrete transport implementations (§9). The
/// session manager stores this, never a trait object, so dispatch is a
/// plain match rather than a vtable call.
pub enum AnyTransport {
    Stdio(StdioTransport),
    Sse(SseClientTransport),
}

#[async_trait]
impl Transport for AnyTransport {
    async fn send_frame(&self, msg: &JsonRpcMessage) -> Result<(), TransportError> {
        match self {
            Self::Stdio(t) => t.send_frame(msg).await,
            Self::Sse(t) => t.send_frame(msg).await,
        }
    }

    async fn recv_frame(&self) -> Result<Option<JsonRpcMessage>, TransportError> {
        match self {
            Self::Stdio(t) => t.recv_frame().await,
            Self::Sse(t) => t.recv_frame().await,
        }
    }

    async fn initialize(
        &self,
        client_info: serde_json::Value,
        timeout: std::time::Duration,
    ) -> Result<serde_json::Value, TransportError> {
        match self {
            Self::Stdio(t) => t.initialize(client_info, timeout).await,
            Self::Sse(t) => t.initialize(client_info, timeout).await,
        }
    }

    async fn drain(&self) {
        match self {
            Self::Stdio(t) => t.drain().await,
            Self::Sse(t) => t.drain().await,
        }
    }

    fn state(&self) -> TransportState {
        match self {
            Self::Stdio(t) => t.state(),
            Self::Sse(t) => t.state(),
        }
    }

    fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio(_) => TransportKind::Stdio,
            Self::Sse(_) => TransportKind::Sse,
        }
    }
}
