// Keystone Tool Server — JSON-RPC Surface
// One POST /rpc entry point for every capability. Sensitive tools answer
// HTTP 403 unless the call carries an approved ticket; the engine converts
// that 403 into a pending-approval flow on its side.

use crate::atoms::constants::TOOL_RPC_TIMEOUT_SECS;
use crate::atoms::error::EngineError;
use crate::toolserver::approvals::ApprovalStatus;
use crate::toolserver::{embed, files, logs, shell, web, ToolServer};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

pub fn router(server: Arc<ToolServer>) -> Router {
    Router::new()
        .route("/rpc", post(rpc))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(server)
}

#[derive(Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

fn rpc_ok(id: &Value, result: Value) -> Response {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
}

fn rpc_err(id: &Value, status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": status.as_u16(), "message": message},
        })),
    )
        .into_response()
}

async fn health() -> Response {
    Json(json!({"status": "healthy"})).into_response()
}

async fn rpc(State(server): State<Arc<ToolServer>>, Json(req): Json<RpcRequest>) -> Response {
    let id = req.id.clone();
    let params = req.params.clone();
    let method = req.method.as_str();

    // Approval management is part of the surface itself, never sensitive
    match method {
        "approval_submit" => {
            let tool = params["tool"].as_str().unwrap_or_default();
            let session = params["session_id"].as_str().unwrap_or_default();
            return match server.approvals.submit(tool, params["params"].clone(), session) {
                Ok(entry) => rpc_ok(&id, json!(entry)),
                Err(e) => rpc_err(&id, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            };
        }
        "approval_list" => {
            let status = match params["status"].as_str() {
                Some("pending") => Some(ApprovalStatus::Pending),
                Some("approved") => Some(ApprovalStatus::Approved),
                Some("denied") => Some(ApprovalStatus::Denied),
                _ => None,
            };
            return rpc_ok(&id, json!(server.approvals.list(status)));
        }
        "approval_resolve" => {
            let entry_id = params["id"].as_str().unwrap_or_default();
            let approve = params["approve"].as_bool().unwrap_or(false);
            return match server.approvals.resolve(entry_id, approve) {
                Ok(entry) => rpc_ok(&id, json!(entry)),
                Err(EngineError::State(m)) => rpc_err(&id, StatusCode::CONFLICT, &m),
                Err(e) => rpc_err(&id, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            };
        }
        _ => {}
    }

    // Sensitive tools need an approved ticket
    if server.registry.is_sensitive(method) {
        let ticket = params["_approval_id"].as_str().unwrap_or_default();
        if !server.approvals.is_approved(ticket, method) {
            return rpc_err(
                &id,
                StatusCode::FORBIDDEN,
                &format!("{method} is sensitive and requires approval"),
            );
        }
    }

    let outcome = dispatch(&server, method, &params).await;
    match outcome {
        Ok(result) => rpc_ok(&id, result),
        Err(EngineError::Security(m)) => rpc_err(&id, StatusCode::FORBIDDEN, &m),
        Err(EngineError::Io(e)) => rpc_err(&id, StatusCode::NOT_FOUND, &e.to_string()),
        Err(e) => {
            warn!("[tools] {} failed: {}", method, e);
            rpc_err(&id, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

async fn dispatch(
    server: &ToolServer,
    method: &str,
    params: &Value,
) -> Result<Value, EngineError> {
    match method {
        "read_file" => {
            let path = require_str(params, "path")?;
            let content = files::read_file(path, &server.cfg.allowed_file_roots)?;
            Ok(json!(content))
        }
        "write_file" => {
            let path = require_str(params, "path")?;
            let content = require_str(params, "content")?;
            files::write_file(path, content, &server.cfg.allowed_file_roots)?;
            Ok(json!({"written": path}))
        }
        "run_shell" => {
            let command = require_str(params, "command")?;
            let use_shell = params["shell"].as_bool().unwrap_or(false);
            let outcome = shell::run_shell(
                command,
                use_shell,
                &server.cfg.shell_whitelist,
                Duration::from_secs(TOOL_RPC_TIMEOUT_SECS),
            )
            .await?;
            Ok(json!(outcome))
        }
        "embedding_query" => {
            let query = require_str(params, "query")?;
            let top_k = params["top_k"].as_u64().unwrap_or(5) as usize;
            let embedder = server
                .embedder
                .as_ref()
                .ok_or_else(|| EngineError::Config("no embedder configured".into()))?;
            embed::embedding_query(&server.volume, &**embedder, query, top_k).await
        }
        "embed_documents" => {
            let paths: Vec<String> = params["paths"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            embed::embed_documents(&server.http, &server.cfg.services.trainer, &paths).await
        }
        "web_search" => {
            server.search_limiter.check("web_search")?;
            let query = require_str(params, "query")?;
            let max = params["max_results"].as_u64().unwrap_or(5) as usize;
            let raw = server.search.search(query, max.max(5) * 2).await?;
            let ranked = web::rank_results(raw, &server.cfg.web_research, max);
            Ok(json!({"results": ranked}))
        }
        "web_fetch" => {
            server.fetch_limiter.check("web_fetch")?;
            let url = require_str(params, "url")?;
            let page = web::web_fetch(&server.http, url, &server.cfg.web_research).await?;
            Ok(json!(page))
        }
        "introspect_logs" => {
            let service = require_str(params, "service")?;
            let lines = params["lines"].as_u64().unwrap_or(50) as usize;
            let found = logs::introspect_logs(
                service,
                lines,
                params["search"].as_str(),
                params["level"].as_str(),
            )?;
            Ok(json!({"lines": found}))
        }
        other => Err(EngineError::tool(other, "unknown method")),
    }
}

fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, EngineError> {
    params[key]
        .as_str()
        .ok_or_else(|| EngineError::Config(format!("missing required param '{key}'")))
}
