//! The in-memory `Session` (§3): one live transport + handshake state bound
//! to a single backend for a single project.
//!
//! A session owns a background demultiplex task that is the only reader of
//! its transport: it matches `Response` frames against `pending_requests` by
//! JSON-RPC id and fans `Notification` frames out to a broadcast channel any
//! number of `ClientChannel`s can subscribe to. This is the "dedicated
//! reader task" shape required by §5's shared-resource policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hubmcp_protocol::jsonrpc::{JsonRpcNotification, RequestId};
use hubmcp_protocol::{JsonRpcMessage, JsonRpcResponse, SessionKey};
use hubmcp_registry::JwtRequirement;
use hubmcp_transport::{AnyTransport, Transport, TransportState};
use std::collections::BTreeSet;

const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

/// One live backend connection. Exclusively owned by the [`crate::manager::SessionManager`];
/// everything else holds a short-lived `Arc` through a [`crate::handle::SessionHandle`].
pub struct Session {
    pub key: SessionKey,
    pub name: String,
    transport: Arc<AnyTransport>,
    inflight: AtomicI64,
    last_used_at: Mutex<Instant>,
    created_at: Instant,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>,
    notify_tx: broadcast::Sender<JsonRpcMessage>,
    pub capabilities: serde_json::Value,
    pub protocol_version: String,
    pub auto_approve_tools: BTreeSet<String>,
    pub jwt_required: JwtRequirement,
    pub timeout_ms: u64,
    demux: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: SessionKey,
        name: String,
        transport: Arc<AnyTransport>,
        capabilities: serde_json::Value,
        protocol_version: String,
        auto_approve_tools: BTreeSet<String>,
        jwt_required: JwtRequirement,
        timeout_ms: u64,
    ) -> Arc<Self> {
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Arc::new(Self {
            key,
            name,
            transport,
            inflight: AtomicI64::new(0),
            last_used_at: Mutex::new(Instant::now()),
            created_at: Instant::now(),
            pending: Mutex::new(HashMap::new()),
            notify_tx,
            capabilities,
            protocol_version,
            auto_approve_tools,
            jwt_required,
            timeout_ms,
            demux: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    #[must_use]
    pub fn auto_approves(&self, tool_name: &str) -> bool {
        self.auto_approve_tools.contains(tool_name)
    }

    /// Start the background reader task. Must be called exactly once, after
    /// the handshake has moved the transport to `Ready`.
    pub fn spawn_demux(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move { session.demux_loop().await });
        *self.demux.lock() = Some(handle);
    }

    async fn demux_loop(self: Arc<Self>) {
        loop {
            match self.transport.recv_frame().await {
                Ok(Some(JsonRpcMessage::Response(response))) => {
                    if let Some(sink) = self.pending.lock().remove(&response.id) {
                        let _ = sink.send(response);
                    } else {
                        debug!(key = %self.key, id = %response.id, "response for unknown/expired request id");
                    }
                }
                Ok(Some(notification @ JsonRpcMessage::Notification(_))) => {
                    // Broadcast::send fails only when there are no subscribers;
                    // that's expected whenever no channel currently routes here.
                    let _ = self.notify_tx.send(notification);
                }
                Ok(Some(JsonRpcMessage::Request(_))) => {
                    debug!(key = %self.key, "backend sent a request; MCP servers don't, ignoring");
                }
                Ok(None) => {
                    warn!(key = %self.key, "transport closed, session going dead");
                    break;
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "transport error, session going dead");
                    break;
                }
            }
        }
        self.fail_all_pending();
    }

    fn fail_all_pending(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (id, sink) in drained {
            let _ = sink.send(JsonRpcResponse::error(
                id,
                hubmcp_protocol::JsonRpcErrorObject {
                    code: hubmcp_protocol::GatewayError::transport_gone("").jsonrpc_code(),
                    message: "transport gone".to_string(),
                    data: None,
                },
            ));
        }
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        self.transport.state()
    }

    #[must_use]
    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn last_used_at(&self) -> Instant {
        *self.last_used_at.lock()
    }

    pub fn touch_and_acquire(&self) {
        *self.last_used_at.lock() = Instant::now();
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self) {
        *self.last_used_at.lock() = Instant::now();
        let prior = self.inflight.fetch_sub(1, Ordering::AcqRel);
        if prior <= 0 {
            // Invariant violation (§7 Fatal): inflight_count must never go
            // negative. This is a bug in a caller, not a runtime condition.
            std::process::abort();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcMessage> {
        self.notify_tx.subscribe()
    }

    /// Send a request and register a one-shot sink under its id, then await
    /// the reply, the deadline, or `cancel` firing — whichever comes first.
    /// On timeout or cancellation, best-effort notifies the backend and
    /// frees the sink, the same cleanup either path needs.
    ///
    /// # Errors
    ///
    /// Returns the transport's send error, or `Err(None)` sentinel-free
    /// timeout via the caller's mapping (see [`crate::manager::SessionManager::invoke`]).
    pub async fn invoke(
        &self,
        request: hubmcp_protocol::jsonrpc::JsonRpcRequest,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse, InvokeError> {
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        if let Err(e) = self
            .transport
            .send_frame(&JsonRpcMessage::Request(request))
            .await
        {
            self.pending.lock().remove(&id);
            return Err(InvokeError::Transport(e.to_string()));
        }

        tokio::select! {
            result = tokio::time::timeout(deadline, rx) => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(InvokeError::Cancelled),
                Err(_) => {
                    self.notify_backend_cancelled(&id).await;
                    Err(InvokeError::Timeout)
                }
            },
            () = cancel.cancelled() => {
                self.notify_backend_cancelled(&id).await;
                Err(InvokeError::Cancelled)
            }
        }
    }

    /// Cancel a specific in-flight request by id. Sends `$/cancelRequest` and
    /// drops the sink so the corresponding `invoke` call observes
    /// [`InvokeError::Cancelled`].
    pub async fn cancel(&self, id: &RequestId) {
        if self.pending.lock().contains_key(id) {
            self.notify_backend_cancelled(id).await;
        }
    }

    /// Drop `id`'s pending sink (if still registered) and tell the backend
    /// to stop working on it. Shared by `invoke`'s timeout/cancellation arms
    /// and `cancel`, which all need this exact cleanup.
    async fn notify_backend_cancelled(&self, id: &RequestId) {
        self.pending.lock().remove(id);
        let cancel = hubmcp_protocol::cancel_notification(id);
        let _ = self
            .transport
            .send_frame(&JsonRpcMessage::Notification(cancel))
            .await;
    }

    pub async fn drain(&self) {
        self.transport.drain().await;
        if let Some(handle) = self.demux.lock().take() {
            handle.abort();
        }
        self.fail_all_pending();
    }

    /// Build a `notifications/initialized`-style client-capabilities payload
    /// is the caller's job; this just exposes the raw `initialize` result.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used_at().elapsed()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflight_round_trips() {
        // Constructing a full Session needs a live transport; exercise the
        // counter logic directly against the atomic instead.
        let counter = AtomicI64::new(0);
        counter.fetch_add(1, Ordering::AcqRel);
        counter.fetch_add(1, Ordering::AcqRel);
        assert_eq!(counter.load(Ordering::Acquire), 2);
        counter.fetch_sub(1, Ordering::AcqRel);
        assert_eq!(counter.load(Ordering::Acquire), 1);
    }
}
