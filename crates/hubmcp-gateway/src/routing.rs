//! Routing (§4.7): resolve which backend a unified-channel request targets,
//! and merge the fan-out results of `tools/list`/`resources/list` across
//! every enabled backend in a project.

use hubmcp_protocol::jsonrpc::JsonRpcRequest;
use hubmcp_protocol::{GatewayError, Result, ServerRef};

/// Methods that fan out across every enabled backend on the unified channel
/// when no specific target is named. Results are merged with each
/// tool/resource name prefixed `"<backend>.<name>"` rather than deduped
/// (§9 open question (b)).
pub const FAN_OUT_METHODS: &[&str] = &["tools/list", "resources/list"];

#[must_use]
pub fn is_fan_out_method(method: &str) -> bool {
    FAN_OUT_METHODS.contains(&method)
}

/// Resolve the backend a single (non-fan-out) request targets: a
/// `params._server` field takes precedence; otherwise the method name's
/// `"<backend>.<method>"` namespace is split off.
///
/// # Errors
///
/// Returns [`GatewayError::BadRequest`] if neither source names a backend.
pub fn resolve_target(request: &JsonRpcRequest) -> Result<(ServerRef, String)> {
    if let Some(server) = request
        .params
        .as_ref()
        .and_then(|p| p.get("_server"))
        .and_then(|v| v.as_str())
    {
        return Ok((ServerRef::parse(server), request.method.clone()));
    }

    if let Some((backend, bare_method)) = request.method.split_once('.') {
        return Ok((ServerRef::parse(backend), bare_method.to_string()));
    }

    Err(GatewayError::BadRequest(format!(
        "cannot resolve target backend for method '{}': no params._server and no '<backend>.<method>' namespace",
        request.method
    )))
}

/// Prefix every `name` field under `array_key` in `payload` with
/// `"<backend_name>."`, in place.
fn prefix_names(backend_name: &str, array_key: &str, mut payload: serde_json::Value) -> serde_json::Value {
    if let Some(items) = payload.get_mut(array_key).and_then(|v| v.as_array_mut()) {
        for item in items.iter_mut() {
            if let Some(name) = item.get("name").and_then(|v| v.as_str()).map(str::to_string) {
                item["name"] = serde_json::Value::String(format!("{backend_name}.{name}"));
            }
        }
    }
    payload
}

/// Merge per-backend `tools/list`/`resources/list` results into one unified
/// array, named-prefixed per backend. Unrecognized methods return an empty
/// object; callers only invoke this for [`is_fan_out_method`] methods.
#[must_use]
pub fn merge_fan_out(method: &str, results: Vec<(String, serde_json::Value)>) -> serde_json::Value {
    let array_key = match method {
        "tools/list" => "tools",
        "resources/list" => "resources",
        _ => return serde_json::json!({}),
    };

    let mut merged = Vec::new();
    for (backend_name, result) in results {
        let prefixed = prefix_names(&backend_name, array_key, result);
        if let Some(items) = prefixed.get(array_key).and_then(|v| v.as_array()) {
            merged.extend(items.iter().cloned());
        }
    }
    serde_json::json!({ array_key: merged })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubmcp_protocol::jsonrpc::{JsonRpcVersion, RequestId};

    fn request(method: &str, params: Option<serde_json::Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            id: RequestId::Number(1),
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn resolves_via_params_server() {
        let req = request("tools/call", Some(serde_json::json!({"_server": "fs", "name": "read"})));
        let (server, method) = resolve_target(&req).unwrap();
        assert_eq!(server, ServerRef::Name("fs".to_string()));
        assert_eq!(method, "tools/call");
    }

    #[test]
    fn resolves_via_namespaced_method() {
        let req = request("fs.tools/call", None);
        let (server, method) = resolve_target(&req).unwrap();
        assert_eq!(server, ServerRef::Name("fs".to_string()));
        assert_eq!(method, "tools/call");
    }

    #[test]
    fn unresolvable_is_bad_request() {
        let req = request("tools/call", None);
        assert!(matches!(resolve_target(&req), Err(GatewayError::BadRequest(_))));
    }

    #[test]
    fn merge_fan_out_prefixes_and_concatenates() {
        let fs_result = serde_json::json!({"tools": [{"name": "read"}]});
        let git_result = serde_json::json!({"tools": [{"name": "commit"}]});
        let merged = merge_fan_out(
            "tools/list",
            vec![("fs".to_string(), fs_result), ("git".to_string(), git_result)],
        );
        let tools = merged["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "fs.read");
        assert_eq!(tools[1]["name"], "git.commit");
    }

    #[test]
    fn merge_fan_out_never_dedupes_same_name() {
        let a = serde_json::json!({"tools": [{"name": "run"}]});
        let b = serde_json::json!({"tools": [{"name": "run"}]});
        let merged = merge_fan_out("tools/list", vec![("a".to_string(), a), ("b".to_string(), b)]);
        assert_eq!(merged["tools"].as_array().unwrap().len(), 2);
    }
}
