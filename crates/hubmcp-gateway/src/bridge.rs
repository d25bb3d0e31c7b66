//! The SSE Bridge (C7): per-project unified SSE endpoint. Accepts inbound
//! JSON-RPC messages over POST, routes them through the Orchestrator, and
//! streams responses and server-initiated notifications back on the
//! matching `ClientChannel`'s SSE stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures::Stream;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use hubmcp_crypto::{EncryptionKey, Envelope};
use hubmcp_protocol::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use hubmcp_protocol::{parse_message, ChannelId, GatewayError, JsonRpcMessage, ProjectId, ServerRef, SessionKey};
use hubmcp_registry::ServerRegistry;
use hubmcp_session::SessionManager;

use crate::channel::{ChannelEvent, ChannelGuard, ChannelState, ClientChannel};
use crate::orchestrator::Orchestrator;
use crate::routing::{is_fan_out_method, merge_fan_out, resolve_target};

const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state for every route in the Bridge's router.
#[derive(Clone)]
pub struct BridgeState {
    manager: Arc<SessionManager>,
    orchestrator: Arc<Orchestrator>,
    registry: Arc<ServerRegistry>,
    encryption_key: Arc<EncryptionKey>,
    outbound_queue_capacity: usize,
    channels: Arc<DashMap<ChannelId, Arc<ClientChannel>>>,
}

impl BridgeState {
    #[must_use]
    pub fn new(
        manager: Arc<SessionManager>,
        orchestrator: Arc<Orchestrator>,
        registry: Arc<ServerRegistry>,
        encryption_key: Arc<EncryptionKey>,
        outbound_queue_capacity: usize,
    ) -> Self {
        Self {
            manager,
            orchestrator,
            registry,
            encryption_key,
            outbound_queue_capacity,
            channels: Arc::new(DashMap::new()),
        }
    }

    fn envelope(&self) -> Envelope<'_> {
        Envelope::new(&self.encryption_key)
    }
}

/// Build the Bridge's router: the unified SSE stream and its message POST
/// endpoint, both scoped under a project id (§4.7).
#[must_use]
pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/projects/{project_id}/unified/sse", get(sse_handler))
        .route(
            "/projects/{project_id}/unified/messages/",
            post(messages_handler),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    channel_id: Uuid,
}

async fn sse_handler(
    State(state): State<BridgeState>,
    Path(project_id): Path<Uuid>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let project_id = ProjectId(project_id);
    let (channel, mut outbound_rx) =
        ClientChannel::new(project_id, None, state.outbound_queue_capacity);
    let channel = Arc::new(channel);
    let channel_id = channel.channel_id;

    state.channels.insert(channel_id, Arc::clone(&channel));
    channel.mark_open();
    info!(channel_id = %channel_id, project_id = %project_id, "unified SSE channel opened");

    let endpoint = format!("/projects/{project_id}/unified/messages/?channel_id={channel_id}");

    // Owned by the generator below so its `Drop` is the channel's one
    // deterministic teardown point, reached whether the loop below breaks on
    // its own or axum drops this future mid-stream on client disconnect.
    let guard = ChannelGuard::new(Arc::clone(&channel), Arc::clone(&state.channels));

    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok(Event::default().event("endpoint").data(endpoint));

        loop {
            tokio::select! {
                event = outbound_rx.recv() => {
                    match event {
                        Some(ChannelEvent::Endpoint(url)) => {
                            yield Ok(Event::default().event("endpoint").data(url));
                        }
                        Some(ChannelEvent::Message(payload)) => {
                            yield Ok(Event::default().event("message").data(payload.to_string()));
                        }
                        Some(ChannelEvent::Ping) => {
                            yield Ok(Event::default().event("ping").data(""));
                        }
                        None => break,
                    }
                }
                () = tokio::time::sleep(PING_INTERVAL) => {
                    yield Ok(Event::default().event("ping").data(""));
                }
            }
        }

        warn!(channel_id = %channel_id, "unified SSE channel closed");
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(PING_INTERVAL))
}

async fn messages_handler(
    State(state): State<BridgeState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
    body: String,
) -> axum::response::Response {
    let project_id = ProjectId(project_id);
    let channel_id = ChannelId(query.channel_id);

    let Some(channel) = state.channels.get(&channel_id).map(|entry| Arc::clone(entry.value())) else {
        return error_response(StatusCode::NOT_FOUND, "unknown channel");
    };

    if channel.state() != ChannelState::Open {
        return error_response(StatusCode::CONFLICT, "channel is closing");
    }

    let message = match parse_message(&body) {
        Ok(m) => m,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let request = match message {
        JsonRpcMessage::Request(request) => request,
        // Bare notifications from the client carry no id to reply to;
        // accept them without spawning routing work.
        JsonRpcMessage::Notification(_) => return StatusCode::ACCEPTED.into_response(),
        JsonRpcMessage::Response(_) => {
            return error_response(StatusCode::BAD_REQUEST, "POST body must be a request or notification")
        }
    };

    // Reserve a delivery slot before accepting, so a full outbound queue is
    // visible to the caller as 503 rather than a response that's silently
    // never delivered (§7 Backpressure).
    let permit = match channel.try_reserve() {
        Ok(permit) => permit,
        Err(GatewayError::Backpressure(msg)) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                [("Retry-After", "1")],
                Json(serde_json::json!({ "error": msg })),
            )
                .into_response();
        }
        Err(_) => return error_response(StatusCode::CONFLICT, "channel is closing"),
    };

    // Registered on the channel so a disconnect (ChannelGuard::drop) can
    // reach into this call and cancel it instead of letting it run to the
    // backend's own timeout (§8 scenario 5).
    let invocation_id = Uuid::new_v4();
    let cancel = CancellationToken::new();
    channel.track_inflight(invocation_id, cancel.clone());

    let task_channel = Arc::clone(&channel);
    tokio::spawn(async move {
        route_and_deliver(state, project_id, Arc::clone(&task_channel), permit, request, cancel).await;
        task_channel.untrack_inflight(invocation_id);
    });

    StatusCode::ACCEPTED.into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Resolve the request's target(s), invoke the Orchestrator, and deliver the
/// (possibly merged) result to the reserved outbound-queue slot. `cancel`
/// fires if the owning channel closes before this finishes.
async fn route_and_deliver(
    state: BridgeState,
    project_id: ProjectId,
    channel: Arc<ClientChannel>,
    permit: tokio::sync::mpsc::OwnedPermit<ChannelEvent>,
    request: JsonRpcRequest,
    cancel: CancellationToken,
) {
    let envelope = state.envelope();
    let id = request.id.clone();

    let response = if is_fan_out_method(&request.method) && has_no_explicit_target(&request) {
        fan_out(&state, project_id, &channel, &request, &envelope, &cancel).await
    } else {
        match resolve_target(&request) {
            Ok((server_ref, method)) => {
                let mut scoped_request = request.clone();
                scoped_request.method = method;
                single_call(&state, project_id, &channel, &server_ref, scoped_request, &envelope, &cancel).await
            }
            Err(e) => JsonRpcResponse::error(
                id.clone(),
                hubmcp_protocol::JsonRpcErrorObject {
                    code: e.jsonrpc_code(),
                    message: e.to_string(),
                    data: None,
                },
            ),
        }
    };

    let payload = serde_json::to_value(&response).unwrap_or_else(|_| serde_json::json!({"error": "encode failure"}));
    permit.send(ChannelEvent::Message(payload));
}

fn has_no_explicit_target(request: &JsonRpcRequest) -> bool {
    request
        .params
        .as_ref()
        .and_then(|p| p.get("_server"))
        .is_none()
        && !request.method.contains('.')
}

async fn single_call(
    state: &BridgeState,
    project_id: ProjectId,
    channel: &Arc<ClientChannel>,
    server_ref: &ServerRef,
    request: JsonRpcRequest,
    envelope: &Envelope<'_>,
    cancel: &CancellationToken,
) -> JsonRpcResponse {
    let id = request.id.clone();
    match state.orchestrator.call(project_id, server_ref, request, envelope, cancel).await {
        Ok((key, response)) => {
            ensure_subscribed(state, channel, key);
            response
        }
        Err(e) => JsonRpcResponse::error(
            id,
            hubmcp_protocol::JsonRpcErrorObject {
                code: e.jsonrpc_code(),
                message: e.to_string(),
                data: None,
            },
        ),
    }
}

/// `tools/list`/`resources/list` with no explicit backend: fan out to every
/// enabled backend in the project and merge, prefixing each entry's name
/// with its backend (§4.7, §9 open question (b)).
async fn fan_out(
    state: &BridgeState,
    project_id: ProjectId,
    channel: &Arc<ClientChannel>,
    request: &JsonRpcRequest,
    envelope: &Envelope<'_>,
    cancel: &CancellationToken,
) -> JsonRpcResponse {
    let id = request.id.clone();

    let servers = match state.registry.list_enabled(project_id, envelope).await {
        Ok(servers) => servers,
        Err(e) => {
            return JsonRpcResponse::error(
                id,
                hubmcp_protocol::JsonRpcErrorObject {
                    code: e.jsonrpc_code(),
                    message: e.to_string(),
                    data: None,
                },
            )
        }
    };

    let mut results = Vec::with_capacity(servers.len());
    for server in servers {
        let server_ref = ServerRef::Id(server.id);
        let scoped_request = request.clone();
        match state
            .orchestrator
            .call(project_id, &server_ref, scoped_request, envelope, cancel)
            .await
        {
            Ok((key, response)) => {
                ensure_subscribed(state, channel, key);
                if let Some(result) = response.result() {
                    results.push((server.name.clone(), result.clone()));
                } else {
                    warn!(backend = %server.name, "fan-out backend returned an error, omitting from merge");
                }
            }
            Err(e) => {
                warn!(backend = %server.name, error = %e, "fan-out backend unreachable, omitting from merge");
            }
        }
    }

    JsonRpcResponse::success(id, merge_fan_out(&request.method, results))
}

/// Subscribe `channel` to `key`'s session notification stream, spawning a
/// forwarder task the first time (§4.7: "the Bridge subscribes the
/// ClientChannel to each Session it routes through").
fn ensure_subscribed(state: &BridgeState, channel: &Arc<ClientChannel>, key: SessionKey) {
    if channel.is_subscribed_to(key) {
        return;
    }
    let Some(mut notifications) = state.manager.subscribe(key) else {
        return;
    };
    let channel_weak = Arc::downgrade(channel);
    let handle = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(message) => {
                    let Some(channel) = channel_weak.upgrade() else {
                        break;
                    };
                    let payload = serde_json::to_value(&message).unwrap_or_default();
                    if channel.send(ChannelEvent::Message(payload)).is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification forwarder lagged, dropping skipped messages");
                }
            }
        }
    });
    channel.subscribe_to(key, handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubmcp_protocol::jsonrpc::{JsonRpcVersion, RequestId};

    #[test]
    fn no_explicit_target_detects_bare_method() {
        let request = JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            id: RequestId::Number(1),
            method: "tools/list".to_string(),
            params: None,
        };
        assert!(has_no_explicit_target(&request));
    }

    #[test]
    fn explicit_server_param_is_not_fan_out() {
        let request = JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            id: RequestId::Number(1),
            method: "tools/list".to_string(),
            params: Some(serde_json::json!({"_server": "fs"})),
        };
        assert!(!has_no_explicit_target(&request));
    }

    #[test]
    fn namespaced_method_is_not_fan_out() {
        let request = JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            id: RequestId::Number(1),
            method: "fs.tools/list".to_string(),
            params: None,
        };
        assert!(!has_no_explicit_target(&request));
    }
}
