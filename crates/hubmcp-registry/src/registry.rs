//! The Server Registry (C2): a pure read adapter over the persisted
//! `backend_servers` table.
//!
//! This adapter issues one database round-trip per [`ServerRegistry::get`]
//! call and caches nothing — the session manager is the cache. Queries are
//! built with runtime `sqlx::query_as`, not the compile-time `query_as!`
//! macro, since this workspace is built without a live database connection
//! or an offline query cache available.

use std::collections::{BTreeMap, BTreeSet};

use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use hubmcp_crypto::Envelope;
use hubmcp_protocol::{GatewayError, ProjectId, ServerId, ServerRef};

use crate::model::{BackendServer, JwtRequirement, TransportConfig};

/// Connects to the backend-server store and exposes the single read
/// operation the rest of the core needs.
pub struct ServerRegistry {
    pool: PgPool,
}

impl ServerRegistry {
    /// Connect to `database_url`, sizing the pool conservatively since this
    /// adapter is only ever called off the session-construction path.
    ///
    /// # Errors
    ///
    /// Returns a [`sqlx::Error`] if the pool cannot be established.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an already-constructed pool, for tests that share a pool across
    /// multiple adapters.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up one `BackendServer`, scoped to `project_id`, decrypting its
    /// at-rest fields with `envelope`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] if no row matches, or
    /// [`GatewayError::DecryptError`] if an encrypted column fails to
    /// authenticate against `envelope`'s key. Any other database failure is
    /// surfaced as [`GatewayError::Internal`].
    pub async fn get(
        &self,
        project_id: ProjectId,
        server_ref: &ServerRef,
        envelope: &Envelope<'_>,
    ) -> Result<BackendServer, GatewayError> {
        let row = self.fetch_row(project_id, server_ref).await?;
        decode_row(row, envelope)
    }

    /// List every enabled `BackendServer` in a project, decrypting each row.
    /// Used only by the unified Bridge's `tools/list`/`resources/list`
    /// fan-out (§4.7); the per-request hot path still goes through
    /// [`Self::get`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DecryptError`] if any row fails to decrypt, or
    /// [`GatewayError::Internal`] on any other database failure.
    pub async fn list_enabled(
        &self,
        project_id: ProjectId,
        envelope: &Envelope<'_>,
    ) -> Result<Vec<BackendServer>, GatewayError> {
        let rows = sqlx::query(
            "SELECT id, project_id, name, enabled, disabled_on_startup_until, transport, \
             timeout_ms, auto_approve_tools, jwt_required, command, args_enc, env_enc, cwd, \
             url, headers_enc \
             FROM backend_servers WHERE project_id = $1 AND enabled = true",
        )
        .bind(project_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::Internal(format!("registry query failed: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let row = ServerRow {
                    id: row.get("id"),
                    project_id: row.get("project_id"),
                    name: row.get("name"),
                    enabled: row.get("enabled"),
                    disabled_on_startup_until: row.get("disabled_on_startup_until"),
                    transport: row.get("transport"),
                    timeout_ms: row.get::<i64, _>("timeout_ms"),
                    auto_approve_tools: row.get("auto_approve_tools"),
                    jwt_required: row.get("jwt_required"),
                    command: row.get("command"),
                    args_enc: row.get("args_enc"),
                    env_enc: row.get("env_enc"),
                    cwd: row.get("cwd"),
                    url: row.get("url"),
                    headers_enc: row.get("headers_enc"),
                };
                decode_row(row, envelope)
            })
            .collect()
    }

    async fn fetch_row(
        &self,
        project_id: ProjectId,
        server_ref: &ServerRef,
    ) -> Result<ServerRow, GatewayError> {
        let query = match server_ref {
            ServerRef::Id(server_id) => sqlx::query(
                "SELECT id, project_id, name, enabled, disabled_on_startup_until, transport, \
                 timeout_ms, auto_approve_tools, jwt_required, command, args_enc, env_enc, cwd, \
                 url, headers_enc \
                 FROM backend_servers WHERE project_id = $1 AND id = $2",
            )
            .bind(project_id.0)
            .bind(server_id.0),
            ServerRef::Name(name) => sqlx::query(
                "SELECT id, project_id, name, enabled, disabled_on_startup_until, transport, \
                 timeout_ms, auto_approve_tools, jwt_required, command, args_enc, env_enc, cwd, \
                 url, headers_enc \
                 FROM backend_servers WHERE project_id = $1 AND name = $2",
            )
            .bind(project_id.0)
            .bind(name),
        };

        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| GatewayError::Internal(format!("registry query failed: {e}")))?
            .ok_or_else(|| GatewayError::not_found(server_ref.to_string()))?;

        debug!(project_id = %project_id, server_ref = %server_ref, "registry hit");

        Ok(ServerRow {
            id: row.get("id"),
            project_id: row.get("project_id"),
            name: row.get("name"),
            enabled: row.get("enabled"),
            disabled_on_startup_until: row.get("disabled_on_startup_until"),
            transport: row.get("transport"),
            timeout_ms: row.get::<i64, _>("timeout_ms"),
            auto_approve_tools: row.get("auto_approve_tools"),
            jwt_required: row.get("jwt_required"),
            command: row.get("command"),
            args_enc: row.get("args_enc"),
            env_enc: row.get("env_enc"),
            cwd: row.get("cwd"),
            url: row.get("url"),
            headers_enc: row.get("headers_enc"),
        })
    }
}

/// The raw shape of one `backend_servers` row before decryption. Encrypted
/// columns are `TEXT` holding the envelope's base64 token, or JSON arrays of
/// tokens / token-valued maps.
struct ServerRow {
    id: Uuid,
    project_id: Uuid,
    name: String,
    enabled: bool,
    disabled_on_startup_until: Option<chrono::DateTime<chrono::Utc>>,
    transport: String,
    timeout_ms: i64,
    auto_approve_tools: Vec<String>,
    jwt_required: String,
    command: Option<String>,
    args_enc: Option<Vec<String>>,
    env_enc: Option<sqlx::types::Json<BTreeMap<String, String>>>,
    cwd: Option<String>,
    url: Option<String>,
    headers_enc: Option<sqlx::types::Json<BTreeMap<String, String>>>,
}

fn decode_row(row: ServerRow, envelope: &Envelope<'_>) -> Result<BackendServer, GatewayError> {
    let jwt_required = match row.jwt_required.as_str() {
        "required" => JwtRequirement::Required,
        "disabled" => JwtRequirement::Disabled,
        _ => JwtRequirement::Inherit,
    };

    let transport = match row.transport.as_str() {
        "stdio" => {
            let command = row
                .command
                .ok_or_else(|| GatewayError::Internal("stdio row missing command".into()))?;
            let args = row
                .args_enc
                .unwrap_or_default()
                .iter()
                .map(|token| envelope.decrypt_str(token))
                .collect::<Result<Vec<_>, _>>()?;
            let env = row
                .env_enc
                .map(|json| json.0)
                .unwrap_or_default()
                .into_iter()
                .map(|(k, token)| envelope.decrypt_str(&token).map(|v| (k, v)))
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd: row.cwd,
            }
        }
        "sse" => {
            let url = row
                .url
                .ok_or_else(|| GatewayError::Internal("sse row missing url".into()))?;
            let headers = row
                .headers_enc
                .map(|json| json.0)
                .unwrap_or_default()
                .into_iter()
                .map(|(k, token)| envelope.decrypt_str(&token).map(|v| (k, v)))
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            TransportConfig::Sse { url, headers }
        }
        other => {
            return Err(GatewayError::Internal(format!(
                "unrecognized transport kind: {other}"
            )))
        }
    };

    Ok(BackendServer {
        id: ServerId(row.id),
        project_id: ProjectId(row.project_id),
        name: row.name,
        enabled: row.enabled,
        disabled_on_startup_until: row.disabled_on_startup_until,
        timeout_ms: row.timeout_ms.max(0) as u64,
        auto_approve_tools: BTreeSet::from_iter(row.auto_approve_tools),
        jwt_required,
        transport,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubmcp_crypto::EncryptionKey;

    #[test]
    fn decodes_stdio_row_with_decrypted_fields() {
        let key = EncryptionKey::generate();
        let envelope = Envelope::new(&key);

        let mut env_map = BTreeMap::new();
        env_map.insert("TOKEN".to_string(), envelope.encrypt_str("abc"));

        let row = ServerRow {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "fs".to_string(),
            enabled: true,
            disabled_on_startup_until: None,
            transport: "stdio".to_string(),
            timeout_ms: 30_000,
            auto_approve_tools: vec!["list_files".to_string()],
            jwt_required: "inherit".to_string(),
            command: Some("echo-mcp".to_string()),
            args_enc: Some(vec![envelope.encrypt_str("--stdio")]),
            env_enc: Some(sqlx::types::Json(env_map)),
            cwd: None,
            url: None,
            headers_enc: None,
        };

        let server = decode_row(row, &envelope).unwrap();
        assert_eq!(server.name, "fs");
        assert!(server.auto_approves("list_files"));
        match server.transport {
            TransportConfig::Stdio { command, args, env, .. } => {
                assert_eq!(command, "echo-mcp");
                assert_eq!(args, vec!["--stdio".to_string()]);
                assert_eq!(env.get("TOKEN"), Some(&"abc".to_string()));
            }
            TransportConfig::Sse { .. } => panic!("expected stdio transport"),
        }
    }

    #[test]
    fn tampered_env_value_surfaces_decrypt_error() {
        let key = EncryptionKey::generate();
        let envelope = Envelope::new(&key);

        let mut token = envelope.encrypt_str("abc");
        token.pop();
        token.push('!');

        let mut env_map = BTreeMap::new();
        env_map.insert("TOKEN".to_string(), token);

        let row = ServerRow {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "fs".to_string(),
            enabled: true,
            disabled_on_startup_until: None,
            transport: "stdio".to_string(),
            timeout_ms: 30_000,
            auto_approve_tools: vec![],
            jwt_required: "inherit".to_string(),
            command: Some("echo-mcp".to_string()),
            args_enc: Some(vec![]),
            env_enc: Some(sqlx::types::Json(env_map)),
            cwd: None,
            url: None,
            headers_enc: None,
        };

        let result = decode_row(row, &envelope);
        assert!(matches!(result, Err(GatewayError::DecryptError)));
    }
}
