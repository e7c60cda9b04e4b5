// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-agent inboxes over the shared channel.
//!
//! An inbox is a *view*: the suffix of the channel after the agent's read
//! cursor, floored at the run-start index, filtered to entries addressed to
//! the agent. Cursors are persisted as a single JSON document so inbox
//! progress survives daemon restarts for persistent workspaces;
//! [`InboxStore::destroy`] deletes them for ephemeral ones.
//!
//! Acknowledgement is the at-most-once edge of the system: the agent loop
//! only acks after a successful backend turn, so a crash or a failed turn
//! leaves the cursor untouched and the same items reappear on the next poll.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use worker_store::Storage;

use crate::channel::ChannelStore;
use crate::message::{visible_to, Message, MessageKind};
use crate::Result;

pub const INBOX_KEY: &str = "_state/inbox.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

/// One entry of an agent's inbox: the message plus routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxItem {
    pub message: Message,
    pub priority: Priority,
    /// True when the agent has marked this item (or a later one) as seen.
    pub seen: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InboxState {
    read_cursors: HashMap<String, String>,
    seen_cursors: HashMap<String, String>,
}

fn priority_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(urgent|asap|blocked|critical)\b").expect("priority regex")
    })
}

fn priority_of(msg: &Message) -> Priority {
    if msg.mentions.len() > 1 || priority_regex().is_match(&msg.content) {
        Priority::High
    } else {
        Priority::Normal
    }
}

/// Inbox cursor bookkeeping for all agents of one workflow instance.
pub struct InboxStore {
    storage: Arc<dyn Storage>,
    channel: Arc<ChannelStore>,
    /// Channel index recorded by [`mark_run_start`]: entries before this
    /// index belong to a previous invocation and are never delivered.
    run_start: AtomicUsize,
    /// Serializes read-modify-write cycles on the cursor document.
    doc_gate: Mutex<()>,
}

impl InboxStore {
    pub fn new(storage: Arc<dyn Storage>, channel: Arc<ChannelStore>) -> Self {
        Self {
            storage,
            channel,
            run_start: AtomicUsize::new(0),
            doc_gate: Mutex::new(()),
        }
    }

    async fn load_state(&self) -> Result<InboxState> {
        match self.storage.read(INBOX_KEY).await? {
            Some(text) => Ok(serde_json::from_str(&text).unwrap_or_default()),
            None => Ok(InboxState::default()),
        }
    }

    async fn save_state(&self, state: &InboxState) -> Result<()> {
        let text = serde_json::to_string_pretty(state)?;
        self.storage.write(INBOX_KEY, &text).await?;
        Ok(())
    }

    /// Record the current channel length as the run-epoch floor: messages
    /// appended before this call are invisible to every subsequent
    /// [`get_inbox`], for every agent.
    pub async fn mark_run_start(&self) -> Result<()> {
        let len = self.channel.len().await?;
        self.run_start.store(len, Ordering::SeqCst);
        Ok(())
    }

    /// The filtered, cursor-gated inbox for `agent`.
    pub async fn get_inbox(&self, agent: &str) -> Result<Vec<InboxItem>> {
        let entries = self.channel.sync().await?;

        // 1. Run-epoch floor.
        let run_start = self.run_start.load(Ordering::SeqCst);
        let entries: &[Message] = if run_start > 0 && run_start <= entries.len() {
            &entries[run_start..]
        } else if run_start > entries.len() {
            &[]
        } else {
            &entries[..]
        };

        // 2. Read cursor. A stale cursor (id no longer found, e.g. after a
        //    cursor reset or a floor that swallowed it) keeps all entries.
        let state = self.load_state().await?;
        let after_ack: &[Message] = match state.read_cursors.get(agent) {
            Some(cursor_id) => match entries.iter().position(|m| &m.id == cursor_id) {
                Some(idx) => &entries[idx + 1..],
                None => entries,
            },
            None => entries,
        };

        // 3. Inbox filter: visibility, no tool-call noise, no self-authored
        //    entries, and only entries addressed to the agent.
        let filtered: Vec<&Message> = after_ack
            .iter()
            .filter(|m| visible_to(m, agent))
            .filter(|m| m.kind != MessageKind::ToolCall)
            .filter(|m| m.from != agent)
            .filter(|m| {
                m.mentions.iter().any(|n| n == agent) || m.to.as_deref() == Some(agent)
            })
            .collect();

        // 4. Seen flag: items at or before the seen cursor's index in the
        //    post-ack filtered list are seen.
        let seen_idx = state
            .seen_cursors
            .get(agent)
            .and_then(|id| filtered.iter().position(|m| &m.id == id));

        Ok(filtered
            .into_iter()
            .enumerate()
            .map(|(i, m)| InboxItem {
                message: m.clone(),
                priority: priority_of(m),
                seen: seen_idx.is_some_and(|s| i <= s),
            })
            .collect())
    }

    /// Advance the read cursor. Idempotent.
    pub async fn ack(&self, agent: &str, until_id: &str) -> Result<()> {
        let _gate = self.doc_gate.lock().await;
        let mut state = self.load_state().await?;
        state
            .read_cursors
            .insert(agent.to_string(), until_id.to_string());
        self.save_state(&state).await
    }

    /// Advance the seen cursor without acknowledging. Idempotent; never
    /// auto-acks no matter how often it is called.
    pub async fn mark_seen(&self, agent: &str, until_id: &str) -> Result<()> {
        let _gate = self.doc_gate.lock().await;
        let mut state = self.load_state().await?;
        state
            .seen_cursors
            .insert(agent.to_string(), until_id.to_string());
        self.save_state(&state).await
    }

    /// Delete the persisted cursor document (ephemeral workspace teardown).
    pub async fn destroy(&self) -> Result<()> {
        self.storage.delete(INBOX_KEY).await?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
