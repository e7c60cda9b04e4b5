// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Workflow lifecycle: YAML specs, the per-instance handle, idle-state
//! computation and the debounced run-mode driver.
//!
//! # Termination detection
//!
//! There is no global clock and no coordinator inside a workflow — agents
//! only exchange channel messages. A workflow instance counts as *complete*
//! when, simultaneously:
//! 1. every loop is `idle`,
//! 2. every agent's inbox is empty,
//! 3. no proposals are open,
//! 4. all of the above has held for the idle debounce window.
//!
//! The debounce absorbs the gap between "agent A appended a mention" and
//! "agent B's poll noticed it": a workflow that momentarily looks idle
//! between turns is not declared done.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use worker_agent::{AgentDefinition, AgentLoop, LoopState};
use worker_context::ContextProvider;

use crate::workspace::Workspace;

/// A workflow as parsed from its YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    /// First channel message, appended as the user at start.
    #[serde(default)]
    pub kickoff: Option<String>,
    pub agents: Vec<AgentDefinition>,
    /// Persistent workflows keep inbox cursors across restarts.
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

fn default_tag() -> String {
    "main".to_string()
}

fn default_persistent() -> bool {
    true
}

impl WorkflowSpec {
    pub fn parse(yaml: &str) -> anyhow::Result<Self> {
        let spec: WorkflowSpec = serde_yaml::from_str(yaml)?;
        anyhow::ensure!(!spec.name.is_empty(), "workflow name must not be empty");
        anyhow::ensure!(!spec.agents.is_empty(), "workflow needs at least one agent");
        for agent in &spec.agents {
            anyhow::ensure!(!agent.name.is_empty(), "every workflow agent needs a name");
        }
        Ok(spec)
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name.clone()).collect()
    }
}

/// `run` drives to completion then tears down; `start` leaves the workflow
/// running indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Run,
    #[default]
    Start,
}

/// One live workflow instance.
pub struct WorkflowHandle {
    pub name: String,
    pub tag: String,
    pub loops: HashMap<String, Arc<AgentLoop>>,
    pub workspace: Arc<Workspace>,
}

impl WorkflowHandle {
    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    pub fn agent_states(&self) -> HashMap<String, &'static str> {
        self.loops
            .iter()
            .map(|(name, l)| (name.clone(), l.state().as_str()))
            .collect()
    }

    /// Stop every loop. Safe to call more than once.
    pub async fn stop_all(&self) {
        for (name, agent_loop) in &self.loops {
            debug!(workflow = %self.key(), agent = %name, "stopping loop");
            agent_loop.stop().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowIdleState {
    pub all_loops_idle: bool,
    pub no_unread_messages: bool,
    pub no_active_proposals: bool,
    pub idle_debounce_elapsed: bool,
}

impl WorkflowIdleState {
    /// The three content conditions, without the debounce.
    pub fn content_complete(&self) -> bool {
        self.all_loops_idle && self.no_unread_messages && self.no_active_proposals
    }

    pub fn is_complete(&self) -> bool {
        self.content_complete() && self.idle_debounce_elapsed
    }
}

/// Compute the instantaneous idle state. The debounce flag is asserted by
/// the runner, which owns the timing.
pub async fn build_workflow_idle_state(
    loops: &HashMap<String, Arc<AgentLoop>>,
    provider: &ContextProvider,
    idle_debounce_elapsed: bool,
) -> WorkflowIdleState {
    let all_loops_idle = loops.values().all(|l| l.state() == LoopState::Idle);

    let mut no_unread_messages = true;
    for agent in provider.agents() {
        match provider.get_inbox(agent).await {
            Ok(items) if !items.is_empty() => {
                no_unread_messages = false;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                // Treat an unreadable inbox as "maybe unread": never declare
                // completion on missing information.
                warn!(agent = %agent, error = %e, "inbox read failed during idle check");
                no_unread_messages = false;
                break;
            }
        }
    }

    let no_active_proposals = provider.active_proposals().await.map(|n| n == 0).unwrap_or(false);

    WorkflowIdleState {
        all_loops_idle,
        no_unread_messages,
        no_active_proposals,
        idle_debounce_elapsed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowRunResult {
    Completed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct RunDriverConfig {
    pub poll_interval: Duration,
    pub idle_debounce: Duration,
    pub timeout: Duration,
}

impl Default for RunDriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            idle_debounce: Duration::from_millis(2000),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Drive a workflow in run mode: block until it is complete (per the
/// debounced idle state) or the timeout passes. On timeout the loops are
/// left running — the caller decides whether to tear down.
pub async fn drive_to_completion(
    handle: &WorkflowHandle,
    config: &RunDriverConfig,
) -> WorkflowRunResult {
    let started = Instant::now();
    let mut first_complete_at: Option<Instant> = None;

    loop {
        if started.elapsed() >= config.timeout {
            warn!(workflow = %handle.key(), "run-mode timeout; not force-killing");
            return WorkflowRunResult::TimedOut;
        }

        let state =
            build_workflow_idle_state(&handle.loops, &handle.workspace.provider, false).await;
        if state.content_complete() {
            let since = first_complete_at.get_or_insert_with(Instant::now);
            if since.elapsed() >= config.idle_debounce {
                info!(workflow = %handle.key(), "workflow complete");
                return WorkflowRunResult::Completed;
            }
        } else {
            // Any activity resets the debounce window.
            first_complete_at = None;
        }

        tokio::time::sleep(config.poll_interval).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use worker_backend::{Backend, ScriptedBackend};
    use worker_context::AppendOptions;
    use worker_store::MemoryStorage;

    fn provider(agents: &[&str]) -> Arc<ContextProvider> {
        Arc::new(ContextProvider::new(
            Arc::new(MemoryStorage::new()),
            agents.iter().map(|s| s.to_string()).collect(),
        ))
    }

    fn idle_loop(name: &str, p: &Arc<ContextProvider>) -> Arc<AgentLoop> {
        let backend: Arc<dyn Backend> = Arc::new(ScriptedBackend::always_text("ok"));
        let l = AgentLoop::new(worker_agent::LoopSpec::bare(name, Arc::clone(p), backend));
        l.start();
        l
    }

    #[test]
    fn spec_parsing_applies_defaults() {
        let spec = WorkflowSpec::parse(
            "name: review\nagents:\n  - name: alice\n    model: m\n",
        )
        .unwrap();
        assert_eq!(spec.tag, "main");
        assert!(spec.persistent);
        assert_eq!(spec.key(), "review:main");
        assert_eq!(spec.agent_names(), vec!["alice"]);
    }

    #[test]
    fn spec_without_agents_is_rejected() {
        assert!(WorkflowSpec::parse("name: empty\nagents: []\n").is_err());
        assert!(WorkflowSpec::parse("name: ''\nagents:\n  - name: a\n").is_err());
    }

    #[tokio::test]
    async fn idle_state_all_green_when_quiet() {
        let p = provider(&["alice"]);
        let mut loops = HashMap::new();
        loops.insert("alice".to_string(), idle_loop("alice", &p));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let state = build_workflow_idle_state(&loops, &p, true).await;
        assert!(state.all_loops_idle);
        assert!(state.no_unread_messages);
        assert!(state.no_active_proposals);
        assert!(state.is_complete());

        for l in loops.values() {
            l.stop().await;
        }
    }

    #[tokio::test]
    async fn unread_messages_block_completion() {
        let p = provider(&["alice"]);
        let mut loops = HashMap::new();
        loops.insert("alice".to_string(), idle_loop("alice", &p));
        tokio::time::sleep(Duration::from_millis(30)).await;

        p.append_channel("user", "@alice wake up", AppendOptions::default())
            .await
            .unwrap();
        let state = build_workflow_idle_state(&loops, &p, true).await;
        assert!(!state.no_unread_messages);
        assert!(!state.is_complete());

        for l in loops.values() {
            l.stop().await;
        }
    }

    #[tokio::test]
    async fn open_proposal_blocks_completion() {
        let p = provider(&["alice", "bob", "carol"]);
        let loops = HashMap::new();
        p.proposals().create("alice", "ship").await.unwrap();

        let state = build_workflow_idle_state(&loops, &p, true).await;
        assert!(!state.no_active_proposals);
        assert!(!state.is_complete());
    }

    #[tokio::test]
    async fn debounce_gates_completion() {
        let state = WorkflowIdleState {
            all_loops_idle: true,
            no_unread_messages: true,
            no_active_proposals: true,
            idle_debounce_elapsed: false,
        };
        assert!(state.content_complete());
        assert!(!state.is_complete());
    }
}
