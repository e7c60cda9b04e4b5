// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The HTTP control plane.
//!
//! JSON in, JSON out; every non-2xx response body is `{"error": "..."}`.
//! When a bearer token is configured every request must carry
//! `Authorization: Bearer <token>` (constant-time comparison); without a
//! configured token the check is disabled. The streaming `/run` endpoint
//! emits server-sent events named `chunk`, `done` and `error`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{any, delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

use worker_agent::RunOutcome;

use crate::daemon::Daemon;
use crate::error::WorkerError;
use crate::workflow::{RunMode, WorkflowSpec};

const BODY_LIMIT: usize = 4 * 1024 * 1024;

/// Build the control-plane router for a daemon.
pub fn router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/shutdown", post(shutdown))
        .route("/agents", get(list_agents).post(create_agent))
        .route("/agents/:name", get(get_agent).delete(delete_agent))
        .route("/run", post(run_agent))
        .route("/serve", post(serve_agent))
        .route("/mcp", any(crate::mcp::handle))
        .route("/workflows", get(list_workflows).post(start_workflow))
        .route("/workflows/:name/:tag", delete(delete_workflow))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&daemon),
            bearer_auth,
        ))
        .with_state(daemon)
}

/// Serve the control plane until shutdown is requested, then run the
/// daemon's graceful teardown.
pub async fn serve(daemon: Arc<Daemon>) -> anyhow::Result<()> {
    daemon.bootstrap().await?;
    let addr = format!("{}:{}", daemon.config().host, daemon.config().port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "control plane listening");

    let app = router(Arc::clone(&daemon));
    let waiter = Arc::clone(&daemon);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { waiter.wait_shutdown().await })
        .await?;

    daemon.shutdown().await;
    Ok(())
}

// ── Auth ──────────────────────────────────────────────────────────────────────

async fn bearer_auth(
    State(daemon): State<Arc<Daemon>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = daemon.config().token.as_deref() else {
        return next.run(req).await;
    };
    let provided = extract_bearer(req.headers());
    match provided {
        // Exact match, constant time.
        Some(token)
            if token.len() == expected.len()
                && bool::from(token.as_bytes().ct_eq(expected.as_bytes())) =>
        {
            next.run(req).await
        }
        _ => {
            warn!("request rejected: bad or missing bearer token");
            WorkerError::Unauthorized.into_response()
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn health(State(daemon): State<Arc<Daemon>>) -> Json<Value> {
    let workflows: Vec<String> = daemon
        .list_workflows()
        .await
        .iter()
        .map(|w| w.key())
        .collect();
    Json(json!({
        "pid": std::process::id(),
        "uptime_secs": daemon.uptime_secs(),
        "port": daemon.config().port,
        "agents": daemon.agents.names(),
        "workflows": workflows,
    }))
}

async fn shutdown(State(daemon): State<Arc<Daemon>>) -> Json<Value> {
    // Reply first, stop shortly after: the 200 must make it back out.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        daemon.request_shutdown();
    });
    Json(json!({ "ok": true }))
}

/// Union of standalone and workflow-derived agents, with states.
async fn list_agents(State(daemon): State<Arc<Daemon>>) -> Json<Value> {
    let mut agents: Vec<Value> = Vec::new();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

    for handle in daemon.agents.handles() {
        seen.insert(handle.name().to_string());
        agents.push(json!({
            "name": handle.name(),
            "model": handle.definition.model,
            "state": handle.state_name(),
            "ephemeral": handle.ephemeral,
        }));
    }
    for wf in daemon.list_workflows().await {
        for (name, state) in wf.agent_states() {
            if seen.insert(name.clone()) {
                agents.push(json!({
                    "name": name,
                    "state": state,
                    "workflow": wf.key(),
                }));
            }
        }
    }
    agents.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Json(json!({ "agents": agents }))
}

#[derive(Debug, Deserialize)]
struct CreateAgentRequest {
    name: String,
    model: String,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    backend: Option<worker_backend::BackendKind>,
    #[serde(default)]
    provider: Option<worker_backend::BackendConfig>,
    #[serde(default)]
    workflow: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    schedule: Option<String>,
}

async fn create_agent(
    State(daemon): State<Arc<Daemon>>,
    body: String,
) -> Result<Response, WorkerError> {
    let req: CreateAgentRequest = parse_json(&body)?;
    if req.name.is_empty() || req.model.is_empty() {
        return Err(WorkerError::Invalid("name and model are required".into()));
    }
    if req.workflow.is_some() || req.tag.is_some() {
        // Workflow membership is declared in the workflow file itself; a
        // running workflow's agent set is fixed at start.
        return Err(WorkerError::Invalid(
            "agents bound to a workflow are declared in its workflow file".into(),
        ));
    }

    let definition = worker_agent::AgentDefinition {
        name: req.name.clone(),
        model: req.model,
        backend: req.backend.unwrap_or_default(),
        provider_config: req.provider,
        system_prompt: req.system,
        schedule: req.schedule,
        ..Default::default()
    };
    daemon.agents.create(definition).await.map_err(|e| {
        let msg = e.to_string();
        if msg.contains("already exists") {
            WorkerError::AlreadyExists(msg)
        } else {
            WorkerError::Internal(msg)
        }
    })?;
    Ok((StatusCode::CREATED, Json(json!({ "name": req.name }))).into_response())
}

async fn get_agent(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, WorkerError> {
    let handle = daemon
        .agents
        .get(&name)
        .ok_or_else(|| WorkerError::NotFound(format!("agent {name:?}")))?;
    Ok(Json(json!({
        "name": handle.name(),
        "model": handle.definition.model,
        "backend": handle.definition.backend,
        "state": handle.state_name(),
        "ephemeral": handle.ephemeral,
        "dir": handle.dir().map(|d| d.display().to_string()),
        "system": handle.definition.system_prompt,
        "schedule": handle.definition.schedule,
    })))
}

async fn delete_agent(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, WorkerError> {
    daemon.delete_agent(&name).await?;
    Ok(Json(json!({ "deleted": name })))
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    agent: String,
    message: String,
}

/// One-shot JSON request/response against a single agent.
async fn serve_agent(
    State(daemon): State<Arc<Daemon>>,
    body: String,
) -> Result<Json<Value>, WorkerError> {
    let req: SendRequest = parse_json(&body)?;
    let agent_loop = daemon.ensure_agent_loop(&req.agent).await?;
    let outcome = agent_loop.send_direct(&req.message).await;
    Ok(Json(outcome_json(&outcome)))
}

/// Streamed variant: SSE events `chunk` (the reply text), `done` (the run
/// summary) and `error`.
async fn run_agent(
    State(daemon): State<Arc<Daemon>>,
    body: String,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, WorkerError> {
    let req: SendRequest = parse_json(&body)?;
    let agent_loop = daemon.ensure_agent_loop(&req.agent).await?;

    let stream = async_stream::stream! {
        let outcome = agent_loop.send_direct(&req.message).await;
        if outcome.success {
            if !outcome.content.is_empty() {
                yield Ok(Event::default().event("chunk").data(outcome.content.clone()));
            }
            yield Ok(Event::default()
                .event("done")
                .data(outcome_json(&outcome).to_string()));
        } else {
            let msg = outcome.error.clone().unwrap_or_else(|| "backend failure".into());
            yield Ok(Event::default().event("error").data(msg));
        }
    };
    Ok(Sse::new(stream))
}

fn outcome_json(outcome: &RunOutcome) -> Value {
    json!({
        "success": outcome.success,
        "content": outcome.content,
        "duration_ms": outcome.duration.as_millis() as u64,
        "steps": outcome.steps,
        "tool_calls": outcome.tool_calls,
        "error": outcome.error,
    })
}

async fn list_workflows(State(daemon): State<Arc<Daemon>>) -> Json<Value> {
    let mut workflows: Vec<Value> = Vec::new();
    for wf in daemon.list_workflows().await {
        let states: HashMap<String, &str> = wf.agent_states();
        workflows.push(json!({
            "name": wf.name,
            "tag": wf.tag,
            "agents": states,
        }));
    }
    Json(json!({ "workflows": workflows }))
}

#[derive(Debug, Deserialize)]
struct StartWorkflowRequest {
    #[serde(flatten)]
    spec: WorkflowSpec,
    #[serde(default)]
    mode: RunMode,
}

async fn start_workflow(
    State(daemon): State<Arc<Daemon>>,
    body: String,
) -> Result<Response, WorkerError> {
    let req: StartWorkflowRequest = parse_json(&body)?;
    if req.spec.agents.is_empty() {
        return Err(WorkerError::Invalid("workflow needs at least one agent".into()));
    }
    let handle = daemon.start_workflow(req.spec, req.mode).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "name": handle.name,
            "tag": handle.tag,
            "agents": handle.loops.keys().collect::<Vec<_>>(),
        })),
    )
        .into_response())
}

async fn delete_workflow(
    State(daemon): State<Arc<Daemon>>,
    Path((name, tag)): Path<(String, String)>,
) -> Result<Json<Value>, WorkerError> {
    daemon.remove_workflow(&name, &tag).await?;
    Ok(Json(json!({ "deleted": format!("{name}:{tag}") })))
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, WorkerError> {
    serde_json::from_str(body).map_err(|e| WorkerError::Invalid(format!("malformed JSON: {e}")))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::DaemonConfig;

    fn test_daemon(token: Option<&str>) -> (tempfile::TempDir, Arc<Daemon>) {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            token: token.map(str::to_string),
            config_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        (dir, Daemon::new(config))
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(path: &str, body: Value) -> HttpRequest<Body> {
        HttpRequest::post(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_pid_and_agents() {
        let (_tmp, daemon) = test_daemon(None);
        let app = router(daemon);
        let resp = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["pid"], std::process::id());
        assert!(body["agents"].is_array());
    }

    #[tokio::test]
    async fn auth_rejects_missing_and_wrong_tokens() {
        let (_tmp, daemon) = test_daemon(Some("sekrit"));
        let app = router(daemon);

        let resp = app
            .clone()
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(resp).await;
        assert!(body["error"].is_string());

        let resp = app
            .clone()
            .oneshot(
                HttpRequest::get("/health")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                HttpRequest::get("/health")
                    .header("authorization", "Bearer sekrit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_get_delete_agent_lifecycle() {
        let (_tmp, daemon) = test_daemon(None);
        let app = router(daemon);

        let resp = app
            .clone()
            .oneshot(post("/agents", json!({"name": "alice", "model": "mock-model"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        // Duplicate name collides.
        let resp = app
            .clone()
            .oneshot(post("/agents", json!({"name": "alice", "model": "mock-model"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app
            .clone()
            .oneshot(HttpRequest::get("/agents/alice").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["name"], "alice");
        assert_eq!(body["state"], "idle");

        let resp = app
            .clone()
            .oneshot(
                HttpRequest::delete("/agents/alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(HttpRequest::get("/agents/alice").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let (_tmp, daemon) = test_daemon(None);
        let app = router(daemon);
        let resp = app
            .oneshot(
                HttpRequest::post("/agents")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("malformed JSON"));
    }

    #[tokio::test]
    async fn serve_runs_a_direct_turn() {
        let (_tmp, daemon) = test_daemon(None);
        daemon
            .agents
            .register_definition(worker_agent::AgentDefinition::new("alice", "mock-model"))
            .await
            .unwrap();
        let app = router(Arc::clone(&daemon));

        let resp = app
            .oneshot(post("/serve", json!({"agent": "alice", "message": "ping"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert!(body["content"].as_str().unwrap().starts_with("MOCK:"));

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn serve_unknown_agent_is_not_found() {
        let (_tmp, daemon) = test_daemon(None);
        let app = router(daemon);
        let resp = app
            .oneshot(post("/serve", json!({"agent": "ghost", "message": "hi"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn run_streams_chunk_and_done_events() {
        let (_tmp, daemon) = test_daemon(None);
        daemon
            .agents
            .register_definition(worker_agent::AgentDefinition::new("alice", "mock-model"))
            .await
            .unwrap();
        let app = router(Arc::clone(&daemon));

        let resp = app
            .oneshot(post("/run", json!({"agent": "alice", "message": "stream me"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/event-stream"));

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("event: chunk"));
        assert!(text.contains("event: done"));

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn workflow_endpoints_round_trip() {
        let (_tmp, daemon) = test_daemon(None);
        let app = router(Arc::clone(&daemon));

        let spec = json!({
            "name": "review",
            "tag": "pr-1",
            "agents": [{"name": "alice", "model": "mock-model"}],
        });
        let resp = app.clone().oneshot(post("/workflows", spec.clone())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        // Same key again: conflict.
        let resp = app.clone().oneshot(post("/workflows", spec)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app
            .clone()
            .oneshot(HttpRequest::get("/workflows").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["workflows"][0]["name"], "review");

        let resp = app
            .clone()
            .oneshot(
                HttpRequest::delete("/workflows/review/pr-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(
                HttpRequest::delete("/workflows/review/pr-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mcp_endpoint_binds_sessions_through_the_gateway() {
        let (_tmp, daemon) = test_daemon(None);
        let app = router(Arc::clone(&daemon));

        // Start a workflow so a workspace exists for alice.
        let resp = app
            .clone()
            .oneshot(post(
                "/workflows",
                json!({
                    "name": "w",
                    "agents": [
                        {"name": "alice", "model": "mock-model"},
                        {"name": "bob", "model": "mock-model"}
                    ],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let init = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}});
        let resp = app
            .clone()
            .oneshot(post("/mcp?agent=alice", init))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let session = resp.headers()[worker_collab::SESSION_HEADER]
            .to_str()
            .unwrap()
            .to_string();

        let call = json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "channel_send", "arguments": {"message": "@bob hello"}},
        });
        let resp = app
            .clone()
            .oneshot(
                HttpRequest::post("/mcp")
                    .header(worker_collab::SESSION_HEADER, session)
                    .body(Body::from(call.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["result"]["isError"], false);

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn agent_creation_with_workflow_field_is_invalid() {
        let (_tmp, daemon) = test_daemon(None);
        let app = router(daemon);
        let resp = app
            .oneshot(post(
                "/agents",
                json!({"name": "a", "model": "m", "workflow": "w", "tag": "t"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
