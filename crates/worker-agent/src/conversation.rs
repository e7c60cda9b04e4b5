// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-agent conversation persistence.
//!
//! [`ConversationLog`] is a JSONL file at `conversations/personal.jsonl`,
//! appended after every successful turn. [`ThinThread`] is the in-memory
//! bounded tail of that log, injected into prompts for continuity; it is
//! restored lazily from the log the first time a loop needs it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default number of conversation messages the thin thread retains.
pub const THIN_THREAD_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only JSONL conversation log.
#[derive(Debug, Clone)]
pub struct ConversationLog {
    path: PathBuf,
}

impl ConversationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, msg: &ConversationMessage) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// The last `n` messages, oldest first. Malformed lines are skipped.
    pub async fn tail(&self, n: usize) -> Vec<ConversationMessage> {
        let Ok(text) = tokio::fs::read_to_string(&self.path).await else {
            return Vec::new();
        };
        let mut messages: Vec<ConversationMessage> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => debug!(error = %e, "skipping malformed conversation line"),
            }
        }
        if messages.len() > n {
            messages.drain(..messages.len() - n);
        }
        messages
    }
}

/// Bounded ring of the most recent conversation messages.
#[derive(Debug)]
pub struct ThinThread {
    capacity: usize,
    entries: VecDeque<ConversationMessage>,
    restored: bool,
}

impl Default for ThinThread {
    fn default() -> Self {
        Self::new(THIN_THREAD_LEN)
    }
}

impl ThinThread {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
            restored: false,
        }
    }

    pub fn push(&mut self, msg: ConversationMessage) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(msg);
        // Anything pushed live supersedes a pending restore.
        self.restored = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ConversationMessage> {
        self.entries.iter().cloned().collect()
    }

    /// Restore the ring from the log's tail, once. No-op after the first
    /// call or after any live push.
    pub async fn restore_from(&mut self, log: &ConversationLog) {
        if self.restored {
            return;
        }
        self.restored = true;
        for msg in log.tail(self.capacity).await {
            if self.entries.len() == self.capacity {
                self.entries.pop_front();
            }
            self.entries.push_back(msg);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_append_and_tail_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path().join("conversations/personal.jsonl"));
        log.append(&ConversationMessage::user("q1")).await.unwrap();
        log.append(&ConversationMessage::assistant("a1")).await.unwrap();

        let tail = log.tail(10).await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].role, Role::User);
        assert_eq!(tail[1].content, "a1");
    }

    #[tokio::test]
    async fn tail_limits_to_last_n() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path().join("c.jsonl"));
        for i in 0..5 {
            log.append(&ConversationMessage::user(format!("m{i}"))).await.unwrap();
        }
        let tail = log.tail(2).await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m3");
    }

    #[tokio::test]
    async fn tail_of_missing_log_is_empty() {
        let log = ConversationLog::new("/nonexistent/path/c.jsonl");
        assert!(log.tail(10).await.is_empty());
    }

    #[test]
    fn thin_thread_never_exceeds_capacity() {
        let mut tt = ThinThread::new(3);
        for i in 0..10 {
            tt.push(ConversationMessage::user(format!("m{i}")));
        }
        assert_eq!(tt.len(), 3);
        let snap = tt.snapshot();
        // The retained messages are the last `capacity` pushed.
        assert_eq!(snap[0].content, "m7");
        assert_eq!(snap[2].content, "m9");
    }

    #[tokio::test]
    async fn thin_thread_restores_from_log_tail_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path().join("c.jsonl"));
        for i in 0..4 {
            log.append(&ConversationMessage::user(format!("m{i}"))).await.unwrap();
        }

        let mut tt = ThinThread::new(3);
        tt.restore_from(&log).await;
        assert_eq!(tt.len(), 3);
        assert_eq!(tt.snapshot()[0].content, "m1");

        // Second restore is a no-op even if the log grew.
        log.append(&ConversationMessage::user("m4")).await.unwrap();
        tt.restore_from(&log).await;
        assert_eq!(tt.snapshot().last().unwrap().content, "m3");
    }

    #[tokio::test]
    async fn live_push_suppresses_restore() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path().join("c.jsonl"));
        log.append(&ConversationMessage::user("old")).await.unwrap();

        let mut tt = ThinThread::new(3);
        tt.push(ConversationMessage::user("live"));
        tt.restore_from(&log).await;
        assert_eq!(tt.len(), 1);
        assert_eq!(tt.snapshot()[0].content, "live");
    }
}
