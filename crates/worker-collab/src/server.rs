// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The sessioned tool-calling endpoint.
//!
//! Speaks JSON-RPC 2.0 over HTTP POST, mounted by the daemon at `/mcp`.
//! Session lifecycle:
//!
//! 1. `initialize` — binds the session to one agent identity, taken from
//!    the `agent` query parameter or the `x-agent-name` header and validated
//!    against the workspace's registered agents. The session id is returned
//!    in the `mcp-session-id` response header.
//! 2. `tools/list` / `tools/call` — routed through the bound session; the
//!    session header is required.
//! 3. `notifications/close` (or HTTP `DELETE`) — releases the session.
//!
//! Tool failures travel on the protocol's error channel (`isError` on the
//! call result); JSON-RPC error objects are reserved for protocol misuse
//! (unknown method, missing session, malformed request).

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::registry::CollabRegistry;

/// Header carrying the session id on both requests and the `initialize`
/// response.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Header alternative to the `agent` query parameter for identity binding.
pub const AGENT_HEADER: &str = "x-agent-name";

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Clone)]
pub struct CollabServerState {
    registry: Arc<CollabRegistry>,
    /// session id → bound agent identity.
    sessions: Arc<Mutex<HashMap<String, String>>>,
}

impl CollabServerState {
    pub fn new(registry: Arc<CollabRegistry>) -> Self {
        Self {
            registry,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<CollabRegistry> {
        &self.registry
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether this mount issued the given session id. Lets a gateway that
    /// fronts several workspaces route follow-up requests to the right one.
    pub async fn owns_session(&self, session: &str) -> bool {
        self.sessions.lock().await.contains_key(session)
    }

    /// Whether this mount serves the given agent identity.
    pub fn serves_agent(&self, agent: &str) -> bool {
        self.registry.agents().iter().any(|a| a == agent)
    }

    /// Drop every session (workspace shutdown).
    pub async fn close_all_sessions(&self) {
        self.sessions.lock().await.clear();
    }

    /// Full request handling, transport-independent: the daemon's `/mcp`
    /// gateway calls this directly, the standalone [`collab_router`] wraps
    /// it in an axum route.
    pub async fn handle_request(
        &self,
        method: Method,
        query: HashMap<String, String>,
        headers: HeaderMap,
        body: String,
    ) -> Response {
        match method {
            Method::DELETE => {
                if let Some(session) = header_value(&headers, SESSION_HEADER) {
                    if self.sessions.lock().await.remove(&session).is_some() {
                        info!(%session, "tool session closed");
                    }
                }
                StatusCode::NO_CONTENT.into_response()
            }
            Method::POST => handle_rpc(self.clone(), query, headers, body).await,
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        }
    }
}

/// Build the axum router for one workspace's tool endpoint.
pub fn collab_router(registry: Arc<CollabRegistry>) -> Router {
    let state = CollabServerState::new(registry);
    Router::new().route("/", any(handle)).with_state(state)
}

async fn handle(
    State(state): State<CollabServerState>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: String,
) -> Response {
    state.handle_request(method, query, headers, body).await
}

async fn handle_rpc(
    state: CollabServerState,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            return rpc_error(Value::Null, -32700, format!("parse error: {e}"));
        }
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let rpc_method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    match rpc_method.as_str() {
        "initialize" => initialize(state, query, headers, id).await,
        // Post-initialize handshake ack; nothing to do.
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        "notifications/close" => {
            if let Some(session) = header_value(&headers, SESSION_HEADER) {
                state.sessions.lock().await.remove(&session);
                info!(%session, "tool session closed");
            }
            StatusCode::ACCEPTED.into_response()
        }
        "tools/list" => {
            let Some(_agent) = bound_agent(&state, &headers).await else {
                return rpc_error(id, -32001, "unknown or missing session".to_string());
            };
            let tools: Vec<Value> = state
                .registry
                .schemas()
                .into_iter()
                .map(|s| {
                    json!({
                        "name": s.name,
                        "description": s.description,
                        "inputSchema": s.parameters,
                    })
                })
                .collect();
            rpc_result(id, json!({ "tools": tools }))
        }
        "tools/call" => {
            let Some(agent) = bound_agent(&state, &headers).await else {
                return rpc_error(id, -32001, "unknown or missing session".to_string());
            };
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return rpc_error(id, -32602, "missing tool name".to_string());
            };
            let args = params
                .get("arguments")
                .cloned()
                .unwrap_or(Value::Object(Default::default()));
            let outcome = state.registry.execute(&agent, name, args).await;
            let text = match &outcome.content {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rpc_result(
                id,
                json!({
                    "content": [{ "type": "text", "text": text }],
                    "isError": outcome.is_error,
                }),
            )
        }
        other => rpc_error(id, -32601, format!("unknown method {other:?}")),
    }
}

async fn initialize(
    state: CollabServerState,
    query: HashMap<String, String>,
    headers: HeaderMap,
    id: Value,
) -> Response {
    let identity = query
        .get("agent")
        .cloned()
        .or_else(|| header_value(&headers, AGENT_HEADER));
    let Some(agent) = identity else {
        return rpc_error(
            id,
            -32602,
            "missing agent identity (agent query parameter or x-agent-name header)".to_string(),
        );
    };
    if !state.registry.agents().iter().any(|a| a == &agent) {
        warn!(%agent, "tool session rejected: unknown agent");
        return rpc_error(id, -32602, format!("unknown agent {agent:?}"));
    }

    let session = uuid::Uuid::new_v4().to_string();
    state
        .sessions
        .lock()
        .await
        .insert(session.clone(), agent.clone());
    info!(%agent, %session, "tool session opened");

    let body = rpc_result_value(
        id,
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": "agent-worker",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
    );
    (
        StatusCode::OK,
        [(SESSION_HEADER, session)],
        axum::Json(body),
    )
        .into_response()
}

/// Resolve the agent bound to the request's session header, if any.
async fn bound_agent(state: &CollabServerState, headers: &HeaderMap) -> Option<String> {
    let session = header_value(headers, SESSION_HEADER)?;
    let agent = state.sessions.lock().await.get(&session).cloned();
    if agent.is_none() {
        debug!(%session, "request with unknown session id");
    }
    agent
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn rpc_result_value(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_result(id: Value, result: Value) -> Response {
    axum::Json(rpc_result_value(id, result)).into_response()
}

fn rpc_error(id: Value, code: i64, message: String) -> Response {
    axum::Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    }))
    .into_response()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
