//! The Orchestrator (C6): thin façade translating a
//! `(project_id, server_ref, request)` tuple into `acquire -> invoke ->
//! release`, with per-project tool auto-approve enforcement.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use hubmcp_crypto::Envelope;
use hubmcp_protocol::{
    jsonrpc::JsonRpcRequest, JsonRpcResponse, ProjectId, Result, ServerRef, SessionKey,
};
use hubmcp_session::SessionManager;

/// External collaborator consulted when a `tools/call` target isn't already
/// in the backend's `auto_approve_tools` set (§4.6). The core never
/// implements approval policy itself; it only calls out and honors the
/// verdict.
#[async_trait]
pub trait ApprovalPolicy: Send + Sync {
    /// # Errors
    ///
    /// Returns [`hubmcp_protocol::GatewayError::Unauthorized`] (or any other
    /// taxonomy member) to deny the call.
    async fn approve(&self, project_id: ProjectId, server_ref: &ServerRef, tool_name: &str) -> Result<()>;
}

/// Approves every call it's asked about. A placeholder default until a real
/// policy collaborator is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllPolicy;

#[async_trait]
impl ApprovalPolicy for AllowAllPolicy {
    async fn approve(&self, _project_id: ProjectId, _server_ref: &ServerRef, _tool_name: &str) -> Result<()> {
        Ok(())
    }
}

pub struct Orchestrator {
    manager: Arc<SessionManager>,
    approval: Arc<dyn ApprovalPolicy>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(manager: Arc<SessionManager>, approval: Arc<dyn ApprovalPolicy>) -> Self {
        Self { manager, approval }
    }

    /// `acquire -> invoke -> release` (§4.6), consulting the approval policy
    /// first for any `tools/call` not already auto-approved. Returns the
    /// resolved session key alongside the response so a caller can subscribe
    /// to that session's notification stream. `cancel` is the caller's
    /// abandon signal — firing it during `invoke` ends the wait early
    /// without skipping `release`.
    ///
    /// # Errors
    ///
    /// Propagates whatever [`SessionManager::acquire`] or
    /// [`SessionManager::invoke`] return, plus the approval policy's own
    /// rejection.
    pub async fn call(
        &self,
        project_id: ProjectId,
        server_ref: &ServerRef,
        request: JsonRpcRequest,
        envelope: &Envelope<'_>,
        cancel: &CancellationToken,
    ) -> Result<(SessionKey, JsonRpcResponse)> {
        let handle = self.manager.acquire(project_id, server_ref, envelope).await?;
        let key = handle.key();

        if request.method == "tools/call" {
            if let Some(name) = tool_call_name(&request) {
                if !handle.session().auto_approves(name) {
                    if let Err(e) = self.approval.approve(project_id, server_ref, name).await {
                        handle.release();
                        return Err(e);
                    }
                }
            }
        }

        let timeout = handle.session().timeout();
        let result = self.manager.invoke(&handle, request, timeout, cancel).await;
        handle.release();
        result.map(|response| (key, response))
    }
}

fn tool_call_name(request: &JsonRpcRequest) -> Option<&str> {
    request.params.as_ref()?.get("name")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_name_reads_params_name() {
        let request = JsonRpcRequest {
            jsonrpc: hubmcp_protocol::jsonrpc::JsonRpcVersion,
            id: hubmcp_protocol::jsonrpc::RequestId::Number(1),
            method: "tools/call".to_string(),
            params: Some(serde_json::json!({"name": "list_files"})),
        };
        assert_eq!(tool_call_name(&request), Some("list_files"));
    }

    #[test]
    fn tool_call_name_missing_is_none() {
        let request = JsonRpcRequest {
            jsonrpc: hubmcp_protocol::jsonrpc::JsonRpcVersion,
            id: hubmcp_protocol::jsonrpc::RequestId::Number(1),
            method: "tools/call".to_string(),
            params: None,
        };
        assert_eq!(tool_call_name(&request), None);
    }

    #[tokio::test]
    async fn allow_all_policy_always_approves() {
        let policy = AllowAllPolicy;
        let project_id = ProjectId(uuid::Uuid::new_v4());
        let server_ref = ServerRef::Name("fs".to_string());
        assert!(policy.approve(project_id, &server_ref, "anything").await.is_ok());
    }
}
