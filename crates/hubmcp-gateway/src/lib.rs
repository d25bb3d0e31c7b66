//! The HTTP-facing façade over the session core: the Orchestrator (C6) and
//! SSE Bridge (C7), plus the ambient `GatewayConfig`.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod orchestrator;
pub mod routing;

pub use bridge::{router, BridgeState};
pub use channel::{ChannelEvent, ChannelGuard, ChannelState, ClientChannel};
pub use config::{ConfigError, GatewayConfig};
pub use orchestrator::{AllowAllPolicy, ApprovalPolicy, Orchestrator};
