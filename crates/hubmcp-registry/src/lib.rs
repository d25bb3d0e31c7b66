//! The Server Registry (C2): a read-only, project-scoped adapter over
//! persisted `BackendServer` rows, decrypting at-rest fields on the way out.

pub mod model;
pub mod registry;

pub use model::{BackendServer, JwtRequirement, TransportConfig};
pub use registry::ServerRegistry;
