// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The daemon state container.
//!
//! Owns the two top-level registries (agents, workspaces) and the live
//! workflow map. All mutation happens through the HTTP/shutdown paths;
//! each collection carries its own lock and loops communicate exclusively
//! through their workspace's channel, so there is no inter-loop
//! synchronization anywhere in the daemon.
//!
//! # Shutdown ordering
//!
//! `shutdown()` stops all loops first (standalone, then per-workflow),
//! then shuts the workflows down, then the remaining workspaces, and
//! removes the discovery file last — so a client that still sees the file
//! always finds a daemon that at least accepts connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use worker_agent::{AgentLoop, AgentRegistry, LoopSpec};
use worker_backend::Backend;
use worker_collab::RegistryToolSet;
use worker_context::{AppendOptions, MessageKind};

use crate::config::DaemonConfig;
use crate::discovery::{self, DaemonInfo};
use crate::error::WorkerError;
use crate::workflow::{
    drive_to_completion, RunDriverConfig, RunMode, WorkflowHandle, WorkflowSpec,
};
use crate::workspace::{RuntimeSpec, Workspace, WorkspaceRegistry};

pub struct Daemon {
    config: DaemonConfig,
    pub agents: Arc<AgentRegistry>,
    pub workspaces: Arc<WorkspaceRegistry>,
    workflows: Mutex<HashMap<String, Arc<WorkflowHandle>>>,
    started_at_ms: i64,
    started: Instant,
    shutdown_requested: AtomicBool,
    shutdown_notify: Notify,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Arc<Self> {
        let agents = Arc::new(AgentRegistry::new(config.agents_dir()));
        Arc::new(Self {
            agents,
            workspaces: Arc::new(WorkspaceRegistry::new()),
            workflows: Mutex::new(HashMap::new()),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
            started: Instant::now(),
            shutdown_requested: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            config,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn mcp_base_url(&self) -> String {
        format!("{}/mcp", self.config.base_url())
    }

    pub fn discovery_info(&self) -> DaemonInfo {
        DaemonInfo {
            pid: std::process::id(),
            host: self.config.host.clone(),
            port: self.config.port,
            started_at: self.started_at_ms,
            token: self.config.token.clone(),
        }
    }

    /// Restore persisted agent definitions and write the discovery file.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        let loaded = self.agents.load_from_disk().await?;
        info!(agents = loaded, "definitions loaded from disk");
        discovery::write(&self.config.config_dir(), &self.discovery_info())?;
        Ok(())
    }

    // ── Loop lookup / lazy creation ───────────────────────────────────────────

    /// `findLoop`: the handle's own loop when present, otherwise the first
    /// workflow whose loop map contains the name.
    pub async fn find_loop(&self, name: &str) -> Option<Arc<AgentLoop>> {
        if let Some(handle) = self.agents.get(name) {
            if let Some(l) = handle.agent_loop() {
                return Some(l);
            }
        }
        for wf in self.workflows.lock().await.values() {
            if let Some(l) = wf.loops.get(name) {
                return Some(Arc::clone(l));
            }
        }
        None
    }

    /// Locate the loop for `name`, creating a standalone workspace + loop
    /// on demand when the handle exists but no loop does.
    pub async fn ensure_agent_loop(&self, name: &str) -> Result<Arc<AgentLoop>, WorkerError> {
        if let Some(l) = self.find_loop(name).await {
            return Ok(l);
        }
        let handle = self
            .agents
            .get(name)
            .ok_or_else(|| WorkerError::NotFound(format!("agent {name:?}")))?;

        let key = format!("agent:{name}");
        let workspace = match self.workspaces.get(&key).await {
            Some(ws) => ws,
            None => {
                let ws = Arc::new(Workspace::create(
                    &RuntimeSpec::for_agent(name),
                    &self.config.workflows_dir(),
                    &self.mcp_base_url(),
                ));
                self.workspaces.insert(Arc::clone(&ws)).await;
                ws
            }
        };

        let backend = worker_backend::from_config(&handle.definition.backend_config())
            .map_err(|e| WorkerError::Invalid(e.to_string()))?;
        let agent_loop = self.build_loop(name, &handle, &workspace, backend, None);
        handle.set_loop(Arc::clone(&agent_loop));
        agent_loop.start();
        info!(agent = %name, "loop created on demand");
        Ok(agent_loop)
    }

    fn build_loop(
        &self,
        name: &str,
        handle: &Arc<worker_agent::AgentHandle>,
        workspace: &Arc<Workspace>,
        backend: Arc<dyn Backend>,
        workflow_key: Option<String>,
    ) -> Arc<AgentLoop> {
        let def = &handle.definition;
        let context = def.context_config.clone().unwrap_or_default();
        AgentLoop::new(LoopSpec {
            name: name.to_string(),
            provider: Arc::clone(&workspace.provider),
            backend,
            config: Default::default(),
            system_prompt: def.system_prompt.clone(),
            tool_set: Some(Arc::new(RegistryToolSet::new(
                Arc::clone(&workspace.registry),
                name,
            ))),
            mcp_url: Some(format!("{}?agent={name}", workspace.mcp_url)),
            max_steps: def.max_steps,
            conversation: handle.conversation().cloned(),
            thin_thread: handle.thin_thread(),
            project: context.project,
            workflow: workflow_key,
            document_path: def.document_path(),
            todo_path: handle.todo_path(),
            tool_names: workspace.mcp_tool_names.clone(),
        })
    }

    // ── Workflows ─────────────────────────────────────────────────────────────

    /// Start a workflow instance. `RunMode::Run` additionally spawns the
    /// idle-detection driver that tears the workflow down on completion.
    pub async fn start_workflow(
        self: &Arc<Self>,
        spec: WorkflowSpec,
        mode: RunMode,
    ) -> Result<Arc<WorkflowHandle>, WorkerError> {
        let key = spec.key();
        // Held across the whole start so two racing POSTs cannot both pass
        // the existence check.
        let mut workflows = self.workflows.lock().await;
        if workflows.contains_key(&key) {
            return Err(WorkerError::Conflict(format!(
                "workflow {key} is already running"
            )));
        }

        let runtime = RuntimeSpec::for_workflow(
            &spec.name,
            &spec.tag,
            spec.agent_names(),
            spec.persistent,
        );
        let workspace = Arc::new(Workspace::create(
            &runtime,
            &self.config.workflows_dir(),
            &self.mcp_base_url(),
        ));
        self.workspaces.insert(Arc::clone(&workspace)).await;

        // The run-epoch floor: anything already in a persistent channel
        // belongs to a previous invocation and must not be redelivered.
        workspace.provider.mark_run_start().await?;

        let mut loops = HashMap::new();
        for def in &spec.agents {
            let backend = worker_backend::from_config(&def.backend_config())
                .map_err(|e| WorkerError::Invalid(e.to_string()))?;
            // Workflow agents are ephemeral: no registry entry, no disk
            // artifacts, lifetime bound to the workflow instance.
            let handle = worker_agent::AgentHandle::ephemeral(def.clone());
            let agent_loop = self.build_loop_for_workflow(&key, def, &handle, &workspace, backend);
            handle.set_loop(Arc::clone(&agent_loop));
            loops.insert(def.name.clone(), agent_loop);
        }

        if let Some(kickoff) = &spec.kickoff {
            workspace
                .provider
                .append_channel("user", kickoff, AppendOptions::default())
                .await?;
        }

        let _ = workspace
            .provider
            .timeline()
            .record("daemon", &format!("workflow {key} started"), MessageKind::Log)
            .await;

        for agent_loop in loops.values() {
            agent_loop.start();
            agent_loop.wake();
        }

        let handle = Arc::new(WorkflowHandle {
            name: spec.name.clone(),
            tag: spec.tag.clone(),
            loops,
            workspace,
        });
        workflows.insert(key.clone(), Arc::clone(&handle));
        drop(workflows);
        info!(workflow = %key, agents = spec.agents.len(), ?mode, "workflow started");

        if mode == RunMode::Run {
            let daemon = Arc::clone(self);
            let run_handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let result =
                    drive_to_completion(&run_handle, &RunDriverConfig::default()).await;
                info!(workflow = %run_handle.key(), ?result, "run mode finished");
                if let Err(e) = daemon
                    .remove_workflow(&run_handle.name, &run_handle.tag)
                    .await
                {
                    warn!(error = %e, "run-mode teardown failed");
                }
            });
        }

        Ok(handle)
    }

    pub async fn list_workflows(&self) -> Vec<Arc<WorkflowHandle>> {
        self.workflows.lock().await.values().cloned().collect()
    }

    pub async fn get_workflow(&self, name: &str, tag: &str) -> Option<Arc<WorkflowHandle>> {
        self.workflows.lock().await.get(&format!("{name}:{tag}")).cloned()
    }

    /// Stop a workflow's loops, shut its workspace down, drop it from both
    /// registries.
    pub async fn remove_workflow(&self, name: &str, tag: &str) -> Result<(), WorkerError> {
        let key = format!("{name}:{tag}");
        let handle = self
            .workflows
            .lock()
            .await
            .remove(&key)
            .ok_or_else(|| WorkerError::NotFound(format!("workflow {key}")))?;

        handle.stop_all().await;
        let _ = handle
            .workspace
            .provider
            .timeline()
            .record("daemon", &format!("workflow {key} stopped"), MessageKind::Log)
            .await;
        handle.workspace.shutdown().await;
        self.workspaces.remove(&handle.workspace.key).await;
        info!(workflow = %key, "workflow removed");
        Ok(())
    }

    fn build_loop_for_workflow(
        &self,
        workflow_key: &str,
        def: &worker_agent::AgentDefinition,
        handle: &Arc<worker_agent::AgentHandle>,
        workspace: &Arc<Workspace>,
        backend: Arc<dyn Backend>,
    ) -> Arc<AgentLoop> {
        self.build_loop(
            &def.name,
            handle,
            workspace,
            backend,
            Some(workflow_key.to_string()),
        )
    }

    // ── Agents ────────────────────────────────────────────────────────────────

    /// Stop the loop (best-effort), shut the standalone workspace down,
    /// unregister and delete artifacts.
    pub async fn delete_agent(&self, name: &str) -> Result<(), WorkerError> {
        let handle = self
            .agents
            .get(name)
            .ok_or_else(|| WorkerError::NotFound(format!("agent {name:?}")))?;
        if let Some(agent_loop) = handle.take_loop() {
            agent_loop.stop().await;
        }
        if let Some(ws) = self.workspaces.remove(&format!("agent:{name}")).await {
            ws.shutdown().await;
        }
        self.agents.delete(name).await;
        Ok(())
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            info!("shutdown requested");
        }
        self.shutdown_notify.notify_waiters();
    }

    pub async fn wait_shutdown(&self) {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return;
        }
        self.shutdown_notify.notified().await;
    }

    /// Graceful teardown; see the module docs for the ordering.
    pub async fn shutdown(&self) {
        info!("daemon shutting down");

        for handle in self.agents.handles() {
            if let Some(agent_loop) = handle.take_loop() {
                agent_loop.stop().await;
            }
        }

        let workflows: Vec<Arc<WorkflowHandle>> =
            self.workflows.lock().await.drain().map(|(_, h)| h).collect();
        for wf in &workflows {
            wf.stop_all().await;
        }
        for wf in &workflows {
            wf.workspace.shutdown().await;
            self.workspaces.remove(&wf.workspace.key).await;
        }

        for ws in self.workspaces.all().await {
            ws.shutdown().await;
            self.workspaces.remove(&ws.key).await;
        }

        discovery::remove(&self.config.config_dir());
        info!("daemon shutdown complete");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
