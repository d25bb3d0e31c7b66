//! The `BackendServer` data model (§3), in its decrypted, ready-to-use form.
//!
//! This is what [`crate::registry::ServerRegistry::get`] returns; it is
//! never constructed with ciphertext still in its fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use hubmcp_protocol::{ProjectId, ServerId};

/// Whether a caller must present a JWT for this backend, or inherits the
/// project default. The core never resolves this chain itself (§9 open
/// question (c)); it only carries the value to whatever external auth
/// collaborator consults it, defaulting an unresolved chain to `Disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JwtRequirement {
    #[default]
    Inherit,
    Required,
    Disabled,
}

impl JwtRequirement {
    /// Resolve an `Inherit` chain against a project default that is itself
    /// `Inherit`, per the design decision recorded for open question (c):
    /// fall through to the least-privileged concrete value rather than loop
    /// or guess.
    #[must_use]
    pub fn resolve(self, project_default: Self) -> Self {
        match self {
            Self::Inherit => match project_default {
                Self::Inherit => Self::Disabled,
                concrete => concrete,
            },
            concrete => concrete,
        }
    }
}

/// Transport-specific connection parameters, decrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<String>,
    },
    Sse {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Sse { .. } => "sse",
        }
    }
}

/// A fully decrypted, ready-to-use backend server definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendServer {
    pub id: ServerId,
    pub project_id: ProjectId,
    pub name: String,
    pub enabled: bool,
    /// A temporary suppression window, e.g. an operator quieting a backend
    /// that crash-looped at process startup. Distinct from `enabled`, which
    /// is a durable operator choice; this lapses on its own once the instant
    /// passes.
    pub disabled_on_startup_until: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
    pub auto_approve_tools: BTreeSet<String>,
    pub jwt_required: JwtRequirement,
    pub transport: TransportConfig,
}

impl BackendServer {
    #[must_use]
    pub fn auto_approves(&self, tool_name: &str) -> bool {
        self.auto_approve_tools.contains(tool_name)
    }

    /// Whether this server is usable right now: `enabled` and not presently
    /// inside its `disabled_on_startup_until` suppression window.
    #[must_use]
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.disabled_on_startup_until.is_none_or(|until| now >= until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inherit_falls_through_to_disabled() {
        let resolved = JwtRequirement::Inherit.resolve(JwtRequirement::Inherit);
        assert_eq!(resolved, JwtRequirement::Disabled);
    }

    #[test]
    fn inherit_takes_concrete_project_default() {
        let resolved = JwtRequirement::Inherit.resolve(JwtRequirement::Required);
        assert_eq!(resolved, JwtRequirement::Required);
    }

    #[test]
    fn concrete_value_ignores_project_default() {
        let resolved = JwtRequirement::Disabled.resolve(JwtRequirement::Required);
        assert_eq!(resolved, JwtRequirement::Disabled);
    }

    fn stub_server(enabled: bool, disabled_on_startup_until: Option<DateTime<Utc>>) -> BackendServer {
        BackendServer {
            id: ServerId(uuid::Uuid::new_v4()),
            project_id: ProjectId(uuid::Uuid::new_v4()),
            name: "fs".to_string(),
            enabled,
            disabled_on_startup_until,
            timeout_ms: 30_000,
            auto_approve_tools: BTreeSet::new(),
            jwt_required: JwtRequirement::Inherit,
            transport: TransportConfig::Stdio {
                command: "echo-mcp".to_string(),
                args: vec![],
                env: BTreeMap::new(),
                cwd: None,
            },
        }
    }

    #[test]
    fn disabled_server_is_never_available() {
        let server = stub_server(false, None);
        assert!(!server.is_available(Utc::now()));
    }

    #[test]
    fn startup_suppression_window_lapses() {
        let now = Utc::now();
        let server = stub_server(true, Some(now + chrono::Duration::seconds(60)));
        assert!(!server.is_available(now));
        assert!(server.is_available(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn enabled_with_no_suppression_is_available() {
        let server = stub_server(true, None);
        assert!(server.is_available(Utc::now()));
    }
}
