//! Shared transport types: the sealed {Stdio, Sse} variant set, state
//! machine, and error taxonomy every transport adapter in this crate speaks.
//!
//! The source system was observed to dispatch over transport kinds via
//! dynamic inheritance; this crate instead expresses transports as a sealed
//! enum over two concrete implementations sharing one operation set
//! (`send_frame`/`recv_frame`/`drain`), matching §9's re-architecture note.

use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// The kind of backend a session's transport talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
}

/// A transport's lifecycle state, shared vocabulary with the Session state
/// machine in §3 (a transport and its owning Session transition together).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Initializing = 0,
    Ready = 1,
    Draining = 2,
    Dead = 3,
}

impl TransportState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initializing,
            1 => Self::Ready,
            2 => Self::Draining,
            _ => Self::Dead,
        }
    }
}

/// Lock-free state cell shared between a transport's public handle and its
/// background reader task, so the reader can flip to `Dead` without taking a
/// lock on the hot read path.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    #[must_use]
    pub fn new(initial: TransportState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> TransportState {
        TransportState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: TransportState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move to `Dead` unless already there; returns whether this call made
    /// the transition (used to avoid double-logging a death).
    pub fn mark_dead(&self) -> bool {
        self.0.swap(TransportState::Dead as u8, Ordering::AcqRel) != TransportState::Dead as u8
    }
}

/// Errors a transport adapter can surface. These are translated into the
/// gateway's public taxonomy (`GatewayError::TransportGone`/`InitError`/
/// `Timeout`) by the session manager, which has the context (which key,
/// which attempt) to pick the right variant.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn backend process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("backend connection failed: {0}")]
    Connect(String),

    #[error("handshake with backend timed out")]
    HandshakeTimeout,

    #[error("backend handshake returned an error: {0}")]
    HandshakeRejected(String),

    #[error("write to backend failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("frame exceeded the maximum size of {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("backend closed the connection")]
    Eof,

    #[error("transport already draining or dead")]
    NotReady,
}

/// Default cap on a single stdio line / SSE `data:` payload before the
/// transport gives up and transitions to `Dead` (§4.3, §6).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Default handshake deadline (§4.3).
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Grace period between `shutdown`+`exit` and SIGTERM during drain (§4.3).
pub const DRAIN_GRACE_MS: u64 = 2_000;

/// Additional grace period between SIGTERM and SIGKILL during drain (§4.3).
pub const DRAIN_KILL_MS: u64 = 3_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_roundtrips() {
        let cell = StateCell::new(TransportState::Initializing);
        assert_eq!(cell.get(), TransportState::Initializing);
        cell.set(TransportState::Ready);
        assert_eq!(cell.get(), TransportState::Ready);
    }

    #[test]
    fn mark_dead_is_idempotent_signal() {
        let cell = StateCell::new(TransportState::Ready);
        assert!(cell.mark_dead());
        assert!(!cell.mark_dead());
        assert_eq!(cell.get(), TransportState::Dead);
    }
}
