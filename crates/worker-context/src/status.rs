// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Agent status board, persisted as one JSON document.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use worker_store::Storage;

use crate::Result;

pub const STATUS_KEY: &str = "_state/agent-status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    #[default]
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub last_update: DateTime<Utc>,
    /// Set on the transition to `running`, cleared on the transition to idle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

pub struct StatusStore {
    storage: Arc<dyn Storage>,
    doc_gate: Mutex<()>,
}

impl StatusStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            doc_gate: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<HashMap<String, AgentStatus>> {
        match self.storage.read(STATUS_KEY).await? {
            Some(text) => Ok(serde_json::from_str(&text).unwrap_or_default()),
            None => Ok(HashMap::new()),
        }
    }

    /// Record a state transition for `agent`.
    ///
    /// Entering `running` stamps `started_at`; entering `idle` clears both
    /// `started_at` and `task`.
    pub async fn set(&self, agent: &str, state: AgentState, task: Option<String>) -> Result<()> {
        let _gate = self.doc_gate.lock().await;
        let mut board = self.load().await?;
        let now = Utc::now();
        let prev = board.get(agent).cloned();
        let status = match state {
            AgentState::Running => AgentStatus {
                state,
                task,
                last_update: now,
                started_at: Some(now),
            },
            AgentState::Idle => AgentStatus {
                state,
                task: None,
                last_update: now,
                started_at: None,
            },
            AgentState::Stopped => AgentStatus {
                state,
                task: task.or(prev.and_then(|p| p.task)),
                last_update: now,
                started_at: None,
            },
        };
        board.insert(agent.to_string(), status);
        let text = serde_json::to_string_pretty(&board)?;
        self.storage.write(STATUS_KEY, &text).await?;
        Ok(())
    }

    pub async fn get(&self, agent: &str) -> Result<Option<AgentStatus>> {
        Ok(self.load().await?.remove(agent))
    }

    pub async fn all(&self) -> Result<HashMap<String, AgentStatus>> {
        self.load().await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
