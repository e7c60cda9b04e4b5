// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The `/mcp` gateway: routes tool-protocol requests to the right
//! workspace mount.
//!
//! Every workspace owns its own [`CollabServerState`] (sessions + tool
//! table). The gateway's only job is dispatch: an `initialize` request is
//! routed by agent identity to the workspace that whitelists that agent;
//! every later request is routed by the session id it carries. The
//! protocol handling itself lives in `worker_collab::server`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use tracing::debug;

use worker_collab::SESSION_HEADER;

use crate::daemon::Daemon;
use crate::workspace::Workspace;

pub async fn handle(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: String,
) -> Response {
    // Session-carrying requests (and DELETE) route by session ownership.
    if let Some(session) = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    {
        if let Some(ws) = find_session_owner(&daemon, &session).await {
            return ws
                .server_state
                .handle_request(method, query, headers, body)
                .await;
        }
        debug!(%session, "request for unknown tool session");
        if method == Method::DELETE {
            return StatusCode::NO_CONTENT.into_response();
        }
        return rpc_error_for(&body, -32001, "unknown or missing session");
    }

    if method != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    // Sessionless POST: only `initialize` (and stray notifications) make
    // sense here. Route by agent identity.
    let rpc_method = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("method").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();

    if rpc_method.starts_with("notifications/") {
        return StatusCode::ACCEPTED.into_response();
    }
    if rpc_method != "initialize" {
        return rpc_error_for(&body, -32001, "unknown or missing session");
    }

    let identity = query
        .get("agent")
        .cloned()
        .or_else(|| {
            headers
                .get(worker_collab::server::AGENT_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });
    let Some(agent) = identity else {
        return rpc_error_for(&body, -32602, "missing agent identity");
    };

    // An explicit workspace key wins; otherwise the first workspace that
    // whitelists the agent serves the session.
    let target = match query.get("workspace") {
        Some(key) => daemon.workspaces.get(key).await,
        None => daemon.workspaces.find_for_agent(&agent).await,
    };
    match target {
        Some(ws) => {
            ws.server_state
                .handle_request(method, query, headers, body)
                .await
        }
        None => rpc_error_for(&body, -32602, &format!("unknown agent {agent:?}")),
    }
}

async fn find_session_owner(daemon: &Daemon, session: &str) -> Option<Arc<Workspace>> {
    for ws in daemon.workspaces.all().await {
        if ws.server_state.owns_session(session).await {
            return Some(ws);
        }
    }
    None
}

fn rpc_error_for(body: &str, code: i64, message: &str) -> Response {
    let id = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .unwrap_or(Value::Null);
    axum::Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    }))
    .into_response()
}
