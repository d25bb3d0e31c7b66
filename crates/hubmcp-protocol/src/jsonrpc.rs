//! JSON-RPC 2.0 wire types shared by every transport and by the SSE bridge.
//!
//! The gateway never interprets `params`/`result` payloads beyond routing
//! fields (`method`, `id`, `params._server`); everything else is opaque
//! [`serde_json::Value`] forwarded verbatim between a client channel and a
//! backend session.

use serde::{Deserialize, Serialize};
use std::fmt;

/// MCP protocol version this gateway speaks on the client wire and advertises
/// during the backend `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// The literal JSON-RPC version string, validated on deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == "2.0" {
            Ok(Self)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported jsonrpc version: {s}"
            )))
        }
    }
}

/// A JSON-RPC request/response id: string or integer, never both in the same
/// message (mixed-type batches are legal across a connection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// A JSON-RPC request: has an `id`, expects exactly one response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// A JSON-RPC notification: no `id`, no response expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Standard JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum JsonRpcResponsePayload {
    Success { result: serde_json::Value },
    Error { error: JsonRpcErrorObject },
}

/// A JSON-RPC response, either a success or an error payload, keyed by the
/// request id it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion,
    pub id: RequestId,
    #[serde(flatten)]
    payload: JsonRpcResponsePayload,
}

impl JsonRpcResponse {
    #[must_use]
    pub fn success(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            payload: JsonRpcResponsePayload::Success { result },
        }
    }

    #[must_use]
    pub fn error(id: RequestId, error: JsonRpcErrorObject) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            payload: JsonRpcResponsePayload::Error { error },
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.payload, JsonRpcResponsePayload::Error { .. })
    }

    #[must_use]
    pub fn result(&self) -> Option<&serde_json::Value> {
        match &self.payload {
            JsonRpcResponsePayload::Success { result } => Some(result),
            JsonRpcResponsePayload::Error { .. } => None,
        }
    }

    #[must_use]
    pub fn into_error(self) -> Option<JsonRpcErrorObject> {
        match self.payload {
            JsonRpcResponsePayload::Error { error } => Some(error),
            JsonRpcResponsePayload::Success { .. } => None,
        }
    }
}

/// Any of the three message shapes the wire can carry, dispatched on shape
/// (requests have `id` + `method`, notifications have `method` only,
/// responses have `id` + `result`/`error`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Notification(_) => None,
            Self::Response(r) => Some(&r.id),
        }
    }
}

/// Parse one line of newline-delimited JSON, or one SSE `data:` payload, into
/// a [`JsonRpcMessage`].
///
/// # Errors
///
/// Returns the underlying `serde_json` error if `raw` is not valid JSON or
/// does not match any of the three message shapes.
pub fn parse_message(raw: &str) -> Result<JsonRpcMessage, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Serialize a message to a single line of JSON (no trailing newline).
///
/// # Errors
///
/// Returns the underlying `serde_json` error if the message cannot be
/// serialized, which should not happen for well-formed values.
pub fn serialize_message(msg: &JsonRpcMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// Build a `$/cancelRequest`-shaped notification for the given id, used when
/// a deadline expires or a client channel disconnects mid-invoke.
#[must_use]
pub fn cancel_notification(id: &RequestId) -> JsonRpcNotification {
    JsonRpcNotification {
        jsonrpc: JsonRpcVersion,
        method: "$/cancelRequest".to_string(),
        params: Some(serde_json::json!({ "id": id })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrips() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#;
        let msg = parse_message(raw).unwrap();
        assert_eq!(msg.method(), Some("tools/list"));
        assert_eq!(msg.id(), Some(&RequestId::Number(1)));
    }

    #[test]
    fn notification_has_no_id() {
        let raw = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let msg = parse_message(raw).unwrap();
        assert!(msg.id().is_none());
    }

    #[test]
    fn rejects_bad_version() {
        let raw = r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#;
        assert!(parse_message(raw).is_err());
    }

    #[test]
    fn success_response_roundtrip() {
        let resp = JsonRpcResponse::success(RequestId::Number(7), serde_json::json!({"ok": true}));
        let raw = serde_json::to_string(&resp).unwrap();
        let parsed: JsonRpcResponse = serde_json::from_str(&raw).unwrap();
        assert!(!parsed.is_error());
        assert_eq!(parsed.result().unwrap()["ok"], serde_json::json!(true));
    }

    #[test]
    fn error_response_roundtrip() {
        let resp = JsonRpcResponse::error(
            RequestId::String("a".into()),
            JsonRpcErrorObject {
                code: -32001,
                message: "not found".into(),
                data: None,
            },
        );
        assert!(resp.is_error());
    }
}
