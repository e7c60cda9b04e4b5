// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Timeline event log. Same `Message` schema and JSONL parsing rules as the
//! channel, deliberately, so read-time merges into unified views are
//! trivial. Append-only; loop runs and workflow lifecycle events land here.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use worker_store::Storage;

use crate::message::{Message, MessageKind};
use crate::Result;

pub const TIMELINE_KEY: &str = "timeline.jsonl";

pub struct TimelineStore {
    storage: Arc<dyn Storage>,
    append_gate: Mutex<()>,
}

impl TimelineStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            append_gate: Mutex::new(()),
        }
    }

    /// Append one event.
    pub async fn record(&self, from: &str, content: &str, kind: MessageKind) -> Result<Message> {
        let msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            from: from.to_string(),
            content: content.to_string(),
            mentions: Vec::new(),
            to: None,
            kind,
        };
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');
        let _gate = self.append_gate.lock().await;
        self.storage.append(TIMELINE_KEY, &line).await?;
        Ok(msg)
    }

    /// Read all events, skipping malformed lines.
    pub async fn read(&self) -> Result<Vec<Message>> {
        let Some(text) = self.storage.read(TIMELINE_KEY).await? else {
            return Ok(Vec::new());
        };
        let mut events = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(msg) => events.push(msg),
                Err(e) => debug!(error = %e, "skipping malformed timeline line"),
            }
        }
        Ok(events)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
