// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Workspaces: one context provider + one tool-server mount per workflow
//! instance or standalone agent.
//!
//! A workspace is the unit of shared state. Creating one composes storage,
//! the context provider, the collaboration tool registry and its session
//! state; shutting one down closes every tool session and, for
//! non-persistent workspaces, clears the transient inbox cursors (the
//! channel and documents are always preserved).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use worker_collab::{build_collab_registry, CollabRegistry, CollabServerState};
use worker_context::ContextProvider;
use worker_store::FileStorage;

/// What kind of runtime a workspace backs, and for whom.
#[derive(Debug, Clone)]
pub struct RuntimeSpec {
    /// `Some` for a workflow workspace, `None` for a standalone agent.
    pub workflow_name: Option<String>,
    pub tag: Option<String>,
    pub agent_names: Vec<String>,
    /// Persistent workspaces live under the config dir and keep their inbox
    /// cursors across restarts; non-persistent ones go to a temp-style path
    /// and have their cursors destroyed on shutdown.
    pub persistent: bool,
}

impl RuntimeSpec {
    pub fn for_workflow(name: &str, tag: &str, agents: Vec<String>, persistent: bool) -> Self {
        Self {
            workflow_name: Some(name.to_string()),
            tag: Some(tag.to_string()),
            agent_names: agents,
            persistent,
        }
    }

    pub fn for_agent(name: &str) -> Self {
        Self {
            workflow_name: None,
            tag: None,
            agent_names: vec![name.to_string()],
            persistent: true,
        }
    }

    /// The registry key: `workflow:<name>:<tag>` or `agent:<name>`.
    pub fn key(&self) -> String {
        match (&self.workflow_name, &self.tag) {
            (Some(name), Some(tag)) => format!("workflow:{name}:{tag}"),
            _ => format!("agent:{}", self.agent_names.first().map(String::as_str).unwrap_or("?")),
        }
    }
}

pub struct Workspace {
    pub key: String,
    pub provider: Arc<ContextProvider>,
    pub registry: Arc<CollabRegistry>,
    pub server_state: CollabServerState,
    /// URL agents use to reach the tool endpoint.
    pub mcp_url: String,
    pub mcp_tool_names: Vec<String>,
    pub context_dir: PathBuf,
    pub persistent: bool,
}

impl Workspace {
    /// Compose a workspace: storage → provider → tool registry → session
    /// state. `workflows_root` is where persistent workflow contexts live;
    /// `mcp_base_url` is the daemon's `/mcp` endpoint.
    pub fn create(
        spec: &RuntimeSpec,
        workflows_root: &std::path::Path,
        mcp_base_url: &str,
    ) -> Self {
        let context_dir = match (&spec.workflow_name, spec.persistent) {
            (Some(name), true) => workflows_root
                .join(name)
                .join(spec.tag.as_deref().unwrap_or("main")),
            (None, true) => workflows_root
                .join("_agents")
                .join(spec.agent_names.first().map(String::as_str).unwrap_or("?")),
            (_, false) => std::env::temp_dir().join(format!("agent-worker-{}", uuid::Uuid::new_v4())),
        };

        let storage = Arc::new(FileStorage::new(&context_dir));
        let provider = Arc::new(ContextProvider::new(storage, spec.agent_names.clone()));
        let registry = Arc::new(build_collab_registry(Arc::clone(&provider)));
        let server_state = CollabServerState::new(Arc::clone(&registry));
        let mcp_tool_names = registry.names();

        let key = spec.key();
        info!(%key, dir = %context_dir.display(), persistent = spec.persistent, "workspace created");
        Self {
            key,
            provider,
            registry,
            server_state,
            mcp_url: mcp_base_url.to_string(),
            mcp_tool_names,
            context_dir,
            persistent: spec.persistent,
        }
    }

    /// Close the tool mount and, for non-persistent workspaces, clear the
    /// transient inbox cursors.
    pub async fn shutdown(&self) {
        self.server_state.close_all_sessions().await;
        if !self.persistent {
            if let Err(e) = self.provider.destroy().await {
                tracing::warn!(key = %self.key, error = %e, "workspace destroy failed");
            }
        }
        info!(key = %self.key, "workspace shut down");
    }
}

/// Daemon-owned map of live workspaces.
#[derive(Default)]
pub struct WorkspaceRegistry {
    workspaces: Mutex<HashMap<String, Arc<Workspace>>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, workspace: Arc<Workspace>) {
        self.workspaces
            .lock()
            .await
            .insert(workspace.key.clone(), workspace);
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Workspace>> {
        self.workspaces.lock().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &str) -> Option<Arc<Workspace>> {
        self.workspaces.lock().await.remove(key)
    }

    pub async fn all(&self) -> Vec<Arc<Workspace>> {
        self.workspaces.lock().await.values().cloned().collect()
    }

    /// The workspace serving a given agent identity, if any.
    pub async fn find_for_agent(&self, agent: &str) -> Option<Arc<Workspace>> {
        self.workspaces
            .lock()
            .await
            .values()
            .find(|ws| ws.provider.agents().iter().any(|a| a == agent))
            .cloned()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
