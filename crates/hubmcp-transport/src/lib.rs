//! Transport Adapters (C3, C4): stdio child-process and outbound SSE
//! transports presenting one uniform JSON-RPC channel to the session layer.

pub mod core;
pub mod sse_client;
pub mod stdio;
pub mod transport;

pub use core::{
    StateCell, TransportError, TransportKind, TransportState, DEFAULT_HANDSHAKE_TIMEOUT_MS,
    DEFAULT_MAX_FRAME_BYTES, DRAIN_GRACE_MS, DRAIN_KILL_MS,
};
pub use sse_client::{SseClientConfig, SseClientTransport};
pub use stdio::{StdioConfig, StdioTransport};
pub use transport::{AnyTransport, Transport};
