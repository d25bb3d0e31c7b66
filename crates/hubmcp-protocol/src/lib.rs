//! Wire types and error taxonomy shared by every crate in the hubmcp
//! workspace: JSON-RPC 2.0 messages, canonical identifiers, and the
//! gateway's error enum.

pub mod error;
pub mod ids;
pub mod jsonrpc;

pub use error::{GatewayError, Result};
pub use ids::{ChannelId, ProjectId, ServerId, ServerRef, SessionKey};
pub use jsonrpc::{
    cancel_notification, parse_message, serialize_message, JsonRpcErrorObject, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, PROTOCOL_VERSION,
};
