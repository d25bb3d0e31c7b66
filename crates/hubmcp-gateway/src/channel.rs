//! `ClientChannel` (§3): in-memory state for one open SSE stream.
//!
//! A channel owns the bounded `outbound_queue` of §5's backpressure policy,
//! the set of session keys it is currently subscribed to for notifications,
//! and the cancellation tokens of any `route_and_deliver` calls routed
//! through it. Its `state` machine is `Opening -> Open -> Closing ->
//! Closed`; the Bridge drives the transitions, this type just records them
//! and stops accepting new events once `Closing`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use hubmcp_protocol::{ChannelId, GatewayError, ProjectId, Result, SessionKey};

pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// One event destined for the client's SSE stream. The Bridge renders these
/// into `axum::response::sse::Event`s; this type stays framework-agnostic so
/// the channel itself doesn't need to depend on axum's response types.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// First event on every channel: the POST URL for inbound messages.
    Endpoint(String),
    /// A JSON-RPC response or server-initiated notification.
    Message(serde_json::Value),
    /// Keepalive, sent at least every 15s per §6.
    Ping,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Opening,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One open SSE connection's routing state. Never outlives its stream task
/// (§3 lifecycle note); dropped when the Bridge's handler returns.
pub struct ClientChannel {
    pub channel_id: ChannelId,
    pub project_id: ProjectId,
    pub caller_identity: Option<String>,
    pub opened_at: Instant,
    state: AtomicU8,
    outbound_tx: mpsc::Sender<ChannelEvent>,
    subscriptions: Mutex<HashMap<SessionKey, JoinHandle<()>>>,
    inflight: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl ClientChannel {
    /// Create a new channel in `Opening` state and the receiver half of its
    /// outbound queue, which the Bridge's SSE stream task drains.
    #[must_use]
    pub fn new(
        project_id: ProjectId,
        caller_identity: Option<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let channel = Self {
            channel_id: ChannelId::new(),
            project_id,
            caller_identity,
            opened_at: Instant::now(),
            state: AtomicU8::new(ChannelState::Opening as u8),
            outbound_tx,
            subscriptions: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        };
        (channel, outbound_rx)
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn mark_open(&self) {
        self.state.store(ChannelState::Open as u8, Ordering::Release);
    }

    pub fn mark_closing(&self) {
        self.state
            .store(ChannelState::Closing as u8, Ordering::Release);
    }

    pub fn mark_closed(&self) {
        self.state
            .store(ChannelState::Closed as u8, Ordering::Release);
    }

    /// Enqueue an event for delivery on this channel's SSE stream.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Backpressure`] if the outbound queue is at
    /// capacity, or [`GatewayError::ChannelClosed`] if the stream task has
    /// already gone away.
    pub fn send(&self, event: ChannelEvent) -> Result<()> {
        if self.state() == ChannelState::Closing || self.state() == ChannelState::Closed {
            return Err(GatewayError::ChannelClosed(self.channel_id.to_string()));
        }
        self.outbound_tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                GatewayError::Backpressure(format!("channel {} outbound queue full", self.channel_id))
            }
            mpsc::error::TrySendError::Closed(_) => {
                GatewayError::ChannelClosed(self.channel_id.to_string())
            }
        })
    }

    /// Reserve a slot in the outbound queue without blocking, so a caller can
    /// learn about backpressure before committing to asynchronous work
    /// (§7: a full queue surfaces as 503 on the accepting POST, not as a
    /// silently dropped later event).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Backpressure`] if the queue is at capacity, or
    /// [`GatewayError::ChannelClosed`] if the channel isn't `Open`.
    pub fn try_reserve(&self) -> Result<mpsc::OwnedPermit<ChannelEvent>> {
        if self.state() != ChannelState::Open {
            return Err(GatewayError::ChannelClosed(self.channel_id.to_string()));
        }
        self.outbound_tx.clone().try_reserve_owned().map_err(|_| {
            GatewayError::Backpressure(format!("channel {} outbound queue full", self.channel_id))
        })
    }

    /// Register the forwarder task for `key`'s session, unless one is
    /// already registered (a channel subscribes to a session at most once).
    /// Returns `true` if this call actually registered a new subscription.
    pub fn subscribe_to(&self, key: SessionKey, forwarder: JoinHandle<()>) -> bool {
        let mut subs = self.subscriptions.lock();
        if subs.contains_key(&key) {
            forwarder.abort();
            return false;
        }
        subs.insert(key, forwarder);
        true
    }

    #[must_use]
    pub fn is_subscribed_to(&self, key: SessionKey) -> bool {
        self.subscriptions.lock().contains_key(&key)
    }

    #[must_use]
    pub fn subscription_keys(&self) -> Vec<SessionKey> {
        self.subscriptions.lock().keys().copied().collect()
    }

    /// Abort every notification-forwarder task and drop the subscription
    /// set. Called once, when the channel transitions to `Closing`.
    pub fn unsubscribe_all(&self) {
        debug!(channel_id = %self.channel_id, "unsubscribing channel from all sessions");
        for (_, handle) in self.subscriptions.lock().drain() {
            handle.abort();
        }
    }

    /// Register a `route_and_deliver` call's cancellation token under a
    /// fresh id, so closing this channel can reach it.
    pub fn track_inflight(&self, invocation_id: Uuid, token: CancellationToken) {
        self.inflight.lock().insert(invocation_id, token);
    }

    /// Drop the bookkeeping entry for a call that already finished on its
    /// own. No-op if `cancel_inflight` already drained it.
    pub fn untrack_inflight(&self, invocation_id: Uuid) {
        self.inflight.lock().remove(&invocation_id);
    }

    /// Fire every still-registered invocation's cancellation token (§8
    /// scenario 5: a client disconnect must not leave a `tools/call` running
    /// until the backend's own timeout). Called once, alongside
    /// `unsubscribe_all`, when the channel closes.
    pub fn cancel_inflight(&self) {
        for (_, token) in self.inflight.lock().drain() {
            token.cancel();
        }
    }
}

/// RAII teardown for one `ClientChannel`. The SSE stream task owns this as a
/// plain local; axum drops the stream's generator future on client
/// disconnect without running any code past its last suspension point, so
/// teardown can only be reached through a local's `Drop`, never through
/// sequential code after the stream's event loop.
pub struct ChannelGuard {
    channel: Arc<ClientChannel>,
    registry: Arc<DashMap<ChannelId, Arc<ClientChannel>>>,
}

impl ChannelGuard {
    #[must_use]
    pub const fn new(
        channel: Arc<ClientChannel>,
        registry: Arc<DashMap<ChannelId, Arc<ClientChannel>>>,
    ) -> Self {
        Self { channel, registry }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.channel.mark_closing();
        self.channel.unsubscribe_all();
        self.channel.cancel_inflight();
        self.channel.mark_closed();
        self.registry.remove(&self.channel.channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_opening_and_transitions_forward() {
        let (channel, _rx) = ClientChannel::new(ProjectId(Uuid::new_v4()), None, 4);
        assert_eq!(channel.state(), ChannelState::Opening);
        channel.mark_open();
        assert_eq!(channel.state(), ChannelState::Open);
        channel.mark_closing();
        assert_eq!(channel.state(), ChannelState::Closing);
        channel.mark_closed();
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn send_fails_once_closing() {
        let (channel, _rx) = ClientChannel::new(ProjectId(Uuid::new_v4()), None, 4);
        channel.mark_open();
        channel.mark_closing();
        let result = channel.send(ChannelEvent::Ping);
        assert!(matches!(result, Err(GatewayError::ChannelClosed(_))));
    }

    #[test]
    fn send_fails_with_backpressure_when_queue_is_full() {
        let (channel, _rx) = ClientChannel::new(ProjectId(Uuid::new_v4()), None, 1);
        channel.mark_open();
        channel.send(ChannelEvent::Ping).unwrap();
        let result = channel.send(ChannelEvent::Ping);
        assert!(matches!(result, Err(GatewayError::Backpressure(_))));
    }

    #[tokio::test]
    async fn subscriptions_dedupe() {
        let (channel, _rx) = ClientChannel::new(ProjectId(Uuid::new_v4()), None, 4);
        let key = SessionKey::new(ProjectId(Uuid::new_v4()), hubmcp_protocol::ServerId(Uuid::new_v4()));
        assert!(channel.subscribe_to(key, tokio::spawn(async {})));
        assert!(!channel.subscribe_to(key, tokio::spawn(async {})));
        assert_eq!(channel.subscription_keys().len(), 1);
    }

    #[test]
    fn try_reserve_fails_once_queue_is_full() {
        let (channel, _rx) = ClientChannel::new(ProjectId(Uuid::new_v4()), None, 1);
        channel.mark_open();
        let permit = channel.try_reserve().unwrap();
        permit.send(ChannelEvent::Ping);
        let result = channel.try_reserve();
        assert!(matches!(result, Err(GatewayError::Backpressure(_))));
    }

    #[tokio::test]
    async fn unsubscribe_all_aborts_forwarders() {
        let (channel, _rx) = ClientChannel::new(ProjectId(Uuid::new_v4()), None, 4);
        let key = SessionKey::new(ProjectId(Uuid::new_v4()), hubmcp_protocol::ServerId(Uuid::new_v4()));
        channel.subscribe_to(key, tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        }));
        channel.unsubscribe_all();
        assert!(channel.subscription_keys().is_empty());
    }

    #[tokio::test]
    async fn cancel_inflight_fires_every_registered_token() {
        let (channel, _rx) = ClientChannel::new(ProjectId(Uuid::new_v4()), None, 4);
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        channel.track_inflight(Uuid::new_v4(), a.clone());
        channel.track_inflight(Uuid::new_v4(), b.clone());
        channel.cancel_inflight();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    /// Tearing down the guard a stream task owns is the only deterministic
    /// disconnect path (axum drops the stream future on client disconnect
    /// without running code after the event loop), so this exercises it the
    /// same way: drop the guard, not a sequential cleanup call.
    #[tokio::test]
    async fn dropping_guard_tears_down_the_channel() {
        let (channel, _rx) = ClientChannel::new(ProjectId(Uuid::new_v4()), None, 4);
        let channel = Arc::new(channel);
        channel.mark_open();

        let registry: Arc<DashMap<ChannelId, Arc<ClientChannel>>> = Arc::new(DashMap::new());
        registry.insert(channel.channel_id, Arc::clone(&channel));

        let key = SessionKey::new(ProjectId(Uuid::new_v4()), hubmcp_protocol::ServerId(Uuid::new_v4()));
        channel.subscribe_to(
            key,
            tokio::spawn(async {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }),
        );
        let token = CancellationToken::new();
        channel.track_inflight(Uuid::new_v4(), token.clone());

        let guard = ChannelGuard::new(Arc::clone(&channel), Arc::clone(&registry));
        drop(guard);

        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.subscription_keys().is_empty());
        assert!(token.is_cancelled());
        assert!(!registry.contains_key(&channel.channel_id));
    }
}
