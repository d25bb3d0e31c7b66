//! The Session Manager (C5): a process-wide cache of live backend
//! connections, keyed by `(project_id, server_id)`, with at-most-one
//! concurrent construction per key and idle eviction.
//!
//! Singleflight is built on [`tokio::sync::OnceCell::get_or_try_init`]
//! rather than a global mutex (§5's closing recommendation): every
//! concurrent `acquire` against an absent key shares the same in-flight
//! construction future, and a failed attempt leaves the cell empty so the
//! next caller gets a clean retry instead of a cached error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use hubmcp_crypto::Envelope;
use hubmcp_protocol::{GatewayError, ProjectId, Result, ServerId, ServerRef, SessionKey};
use hubmcp_registry::{BackendServer, ServerRegistry, TransportConfig};
use hubmcp_transport::{
    AnyTransport, SseClientConfig, SseClientTransport, StdioConfig, StdioTransport, Transport,
    TransportState,
};

use crate::config::SessionManagerConfig;
use crate::handle::SessionHandle;
use crate::session::Session;

struct SessionCell {
    once: OnceCell<Arc<Session>>,
}

impl SessionCell {
    fn new() -> Self {
        Self {
            once: OnceCell::new(),
        }
    }
}

/// The central coordinator (C5). One instance lives for the process
/// lifetime, constructed after the [`hubmcp_crypto::EncryptionKey`] and
/// [`ServerRegistry`] per the initialization order in §9.
pub struct SessionManager {
    sessions: DashMap<SessionKey, Arc<SessionCell>>,
    name_index: DashMap<(ProjectId, String), ServerId>,
    registry: Arc<ServerRegistry>,
    config: SessionManagerConfig,
}

impl SessionManager {
    #[must_use]
    pub fn new(registry: Arc<ServerRegistry>, config: SessionManagerConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            name_index: DashMap::new(),
            registry,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    /// Resolve a caller-supplied ref to the canonical key, hitting the
    /// registry only when the name isn't already indexed (a genuine miss per
    /// §4.2's "must not call it on the hot path" rule). Returns the
    /// [`BackendServer`] too when that resolution happened to fetch one, so
    /// construction doesn't re-query it.
    async fn resolve_key(
        &self,
        project_id: ProjectId,
        server_ref: &ServerRef,
        envelope: &Envelope<'_>,
    ) -> Result<(SessionKey, Option<BackendServer>)> {
        match server_ref {
            ServerRef::Id(id) => Ok((SessionKey::new(project_id, *id), None)),
            ServerRef::Name(name) => {
                if let Some(id) = self.name_index.get(&(project_id, name.clone())) {
                    return Ok((SessionKey::new(project_id, *id), None));
                }
                let server = self.registry.get(project_id, server_ref, envelope).await?;
                self.name_index
                    .insert((project_id, server.name.clone()), server.id);
                let key = SessionKey::new(project_id, server.id);
                Ok((key, Some(server)))
            }
        }
    }

    /// `acquire` (§4.5): resolve, reuse a Ready session, wait on an
    /// in-flight Initializing one, or construct a fresh one — singleflight
    /// across concurrent callers for the same absent key.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] if no such backend exists,
    /// [`GatewayError::InitError`] if construction's handshake fails, or
    /// [`GatewayError::TransportGone`] if the session is draining.
    pub async fn acquire(
        &self,
        project_id: ProjectId,
        server_ref: &ServerRef,
        envelope: &Envelope<'_>,
    ) -> Result<SessionHandle> {
        let (key, mut provided) = self.resolve_key(project_id, server_ref, envelope).await?;

        loop {
            let cell = self
                .sessions
                .entry(key)
                .or_insert_with(|| Arc::new(SessionCell::new()))
                .value()
                .clone();

            let provided_server = provided.take();
            let construct = || async {
                self.construct_session(key, provided_server, envelope)
                    .await
            };

            let result = cell.once.get_or_try_init(construct).await;

            match result {
                Ok(session) => {
                    match session.state() {
                        TransportState::Ready => {
                            return Ok(SessionHandle::new(Arc::clone(session), key));
                        }
                        TransportState::Dead => {
                            self.drop_key(&key, session);
                            continue;
                        }
                        TransportState::Draining => {
                            return Err(GatewayError::transport_gone(
                                "session is draining, retry shortly",
                            ));
                        }
                        TransportState::Initializing => {
                            // get_or_try_init only returns once its future
                            // resolved; a Ready-or-Dead transport is the only
                            // reachable state here in practice, but treat an
                            // unexpected Initializing as not-yet-usable.
                            return Err(GatewayError::init_error(
                                "session not yet ready",
                            ));
                        }
                    }
                }
                Err(e) => {
                    // Construction failed: drop the empty cell so the next
                    // caller gets a clean retry rather than a cached error.
                    self.sessions.remove(&key);
                    return Err(e);
                }
            }
        }
    }

    fn drop_key(&self, key: &SessionKey, session: &Arc<Session>) {
        self.sessions.remove(key);
        self.name_index.retain(|_, v| *v != key.server_id);
        warn!(key = %key, name = %session.name, "removed dead session from cache");
    }

    async fn construct_session(
        &self,
        key: SessionKey,
        provided: Option<BackendServer>,
        envelope: &Envelope<'_>,
    ) -> Result<Arc<Session>> {
        let server = match provided {
            Some(s) => s,
            None => {
                self.registry
                    .get(key.project_id, &ServerRef::Id(key.server_id), envelope)
                    .await?
            }
        };

        if !server.is_available(chrono::Utc::now()) {
            return Err(GatewayError::not_found(format!(
                "backend server {} is disabled",
                server.name
            )));
        }

        let timeout_ms = if server.timeout_ms == 0 {
            self.config.default_timeout_ms
        } else {
            server.timeout_ms
        };
        let timeout = Duration::from_millis(timeout_ms);

        let transport = self.spawn_transport(&server).await?;
        let transport = Arc::new(transport);

        let client_info = serde_json::json!({
            "protocolVersion": hubmcp_protocol::PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "hubmcp-gateway", "version": env!("CARGO_PKG_VERSION") },
        });

        let capabilities = transport
            .initialize(client_info, timeout)
            .await
            .map_err(|e| GatewayError::init_error(e.to_string()))?;

        info!(key = %key, name = %server.name, "backend session ready");

        let session = Session::new(
            key,
            server.name.clone(),
            transport,
            capabilities,
            hubmcp_protocol::PROTOCOL_VERSION.to_string(),
            server.auto_approve_tools.clone(),
            server.jwt_required,
            timeout_ms,
        );
        session.spawn_demux();
        Ok(session)
    }

    async fn spawn_transport(&self, server: &BackendServer) -> Result<AnyTransport> {
        match &server.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let config = StdioConfig {
                    command: command.clone(),
                    args: args.clone(),
                    env: HashMap::from_iter(env.clone()),
                    cwd: cwd.clone(),
                    max_frame_bytes: self.config.max_frame_bytes,
                };
                let transport = StdioTransport::spawn(config)
                    .await
                    .map_err(|e| GatewayError::init_error(e.to_string()))?;
                Ok(AnyTransport::Stdio(transport))
            }
            TransportConfig::Sse { url, headers } => {
                let config = SseClientConfig {
                    url: url.clone(),
                    headers: HashMap::from_iter(headers.clone()),
                    max_frame_bytes: self.config.max_frame_bytes,
                };
                let transport = SseClientTransport::spawn(config)
                    .map_err(|e| GatewayError::init_error(e.to_string()))?;
                Ok(AnyTransport::Sse(transport))
            }
        }
    }

    /// `invoke` (§4.5): forward a request on the handle's transport and
    /// await the reply, translating timeouts/transport failures into the
    /// public taxonomy and letting a dead transport be reaped on the next
    /// `acquire`. `cancel` lets a caller (the Bridge, on client disconnect)
    /// abandon the wait early; the Session still notifies the backend and
    /// frees the pending slot, exactly as it would on its own timeout.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Timeout`] on deadline expiry or
    /// [`GatewayError::TransportGone`] if the underlying transport failed.
    pub async fn invoke(
        &self,
        handle: &SessionHandle,
        request: hubmcp_protocol::jsonrpc::JsonRpcRequest,
        deadline: Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<hubmcp_protocol::JsonRpcResponse> {
        handle
            .session()
            .invoke(request, deadline, cancel)
            .await
            .map_err(|e| match e {
                crate::session::InvokeError::Timeout => {
                    GatewayError::timeout("backend did not reply within the deadline")
                }
                crate::session::InvokeError::Transport(msg) => GatewayError::transport_gone(msg),
                crate::session::InvokeError::Cancelled => {
                    GatewayError::timeout("request was cancelled")
                }
            })
    }

    /// Cancel a specific in-flight request on `key`'s session, used when a
    /// `ClientChannel` disconnects.
    pub async fn cancel(&self, key: SessionKey, id: &hubmcp_protocol::jsonrpc::RequestId) {
        if let Some(cell) = self.sessions.get(&key) {
            if let Some(session) = cell.once.get() {
                session.cancel(id).await;
            }
        }
    }

    /// Subscribe to `key`'s session's notification stream, for a
    /// `ClientChannel` that just routed a request through it. Returns `None`
    /// if no such session is currently constructed.
    #[must_use]
    pub fn subscribe(
        &self,
        key: SessionKey,
    ) -> Option<tokio::sync::broadcast::Receiver<hubmcp_protocol::JsonRpcMessage>> {
        self.sessions
            .get(&key)
            .and_then(|cell| cell.once.get().map(|session| session.subscribe()))
    }

    /// `evict` (§4.5): transition to Draining, refuse new acquires, wait for
    /// `inflight_count == 0` up to the configured grace period, then drain
    /// the transport and remove the entry.
    pub async fn evict(&self, key: SessionKey, reason: &str) {
        let Some(cell) = self.sessions.get(&key).map(|e| e.value().clone()) else {
            return;
        };
        let Some(session) = cell.once.get().cloned() else {
            return; // still constructing; nothing to evict yet
        };

        info!(key = %key, reason, "evicting session");

        let deadline = tokio::time::Instant::now() + self.config.evict_grace;
        while session.inflight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        session.drain().await;
        self.drop_key(&key, &session);
    }

    /// Snapshot of keys whose sessions are idle-eligible
    /// (`last_used_at` older than `idle_timeout` and `inflight_count == 0`)
    /// or already Dead. Used by the [`crate::janitor::Janitor`] so it never
    /// holds the session table locked across a `Drain`.
    #[must_use]
    pub fn eligible_for_eviction(&self) -> Vec<SessionKey> {
        self.sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value().once.get()?;
                let eligible = session.state() == TransportState::Dead
                    || (session.inflight() == 0 && session.idle_for() >= self.config.idle_timeout);
                eligible.then_some(*entry.key())
            })
            .collect()
    }

    /// Every key with a constructed (non-`Dead`) session, for a final
    /// shutdown drain.
    #[must_use]
    pub fn all_keys(&self) -> Vec<SessionKey> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().once.initialized())
            .map(|entry| *entry.key())
            .collect()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn session_cell_starts_uninitialized() {
        let cell = SessionCell::new();
        assert!(cell.once.get().is_none());
    }

    /// Exercises the `OnceCell::get_or_try_init` singleflight mechanism
    /// `acquire` builds on, directly against a shared cell rather than a
    /// full `SessionManager` (which needs a live `ServerRegistry`
    /// connection to resolve a key). Mirrors §8's scenario 3: 50 concurrent
    /// callers against an empty cache see exactly one construction.
    #[tokio::test]
    async fn singleflight_constructs_exactly_once_under_concurrent_load() {
        let cell: Arc<OnceCell<Arc<u32>>> = Arc::new(OnceCell::new());
        let construction_count = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let construction_count = Arc::clone(&construction_count);
                tokio::spawn(async move {
                    *cell
                        .get_or_try_init(|| async {
                            construction_count.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok::<_, GatewayError>(Arc::new(42u32))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(*task.await.unwrap(), 42);
        }
        assert_eq!(construction_count.load(Ordering::SeqCst), 1);
    }

    /// A failed construction must not poison the cell for the *next*
    /// `acquire` call on a fresh cell (§4.5's "clean retry" guarantee) —
    /// `get_or_try_init` leaves the cell empty on `Err`, so a subsequent
    /// call on the same cell tries again rather than replaying the error.
    #[tokio::test]
    async fn failed_construction_leaves_cell_retryable() {
        let cell: OnceCell<Arc<u32>> = OnceCell::new();
        let first = cell
            .get_or_try_init(|| async { Err::<Arc<u32>, GatewayError>(GatewayError::init_error("boom")) })
            .await;
        assert!(first.is_err());
        assert!(cell.get().is_none());

        let second = cell
            .get_or_try_init(|| async { Ok::<_, GatewayError>(Arc::new(7u32)) })
            .await
            .unwrap();
        assert_eq!(**second, 7);
    }
}
