//! Canonical identifiers used throughout the gateway core.
//!
//! The source system was observed to spell a session key three different
//! ways depending on code path (`"<project>.<server_id>"`, a raw UUID, or
//! `"<uuid>_<name>"`). This crate collapses all of that to one tuple type;
//! string-form keys are parsed only where the wire actually hands us one.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque project identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub Uuid);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque server identifier (the `BackendServer.id` column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The way a caller names a backend server: by opaque id, or by its
/// project-unique human name. Parsed once at the protocol boundary (the
/// Orchestrator's entrypoint) and never reparsed downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerRef {
    Id(ServerId),
    Name(String),
}

impl ServerRef {
    /// Parse a caller-supplied string into a [`ServerRef`], preferring the
    /// UUID interpretation when the string parses as one.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match Uuid::parse_str(raw) {
            Ok(uuid) => Self::Id(ServerId(uuid)),
            Err(_) => Self::Name(raw.to_string()),
        }
    }
}

impl fmt::Display for ServerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

/// The single canonical session key: `(project_id, server_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub project_id: ProjectId,
    pub server_id: ServerId,
}

impl SessionKey {
    #[must_use]
    pub const fn new(project_id: ProjectId, server_id: ServerId) -> Self {
        Self {
            project_id,
            server_id,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.server_id)
    }
}

/// Opaque identifier for one open SSE client channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub Uuid);

impl ChannelId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_ref_prefers_uuid() {
        let id = Uuid::new_v4();
        let parsed = ServerRef::parse(&id.to_string());
        assert_eq!(parsed, ServerRef::Id(ServerId(id)));
    }

    #[test]
    fn server_ref_falls_back_to_name() {
        let parsed = ServerRef::parse("fs");
        assert_eq!(parsed, ServerRef::Name("fs".to_string()));
    }

    #[test]
    fn session_key_display_is_stable() {
        let p = ProjectId(Uuid::nil());
        let s = ServerId(Uuid::nil());
        let key = SessionKey::new(p, s);
        assert_eq!(
            key.to_string(),
            "00000000-0000-0000-0000-000000000000/00000000-0000-0000-0000-000000000000"
        );
    }
}
