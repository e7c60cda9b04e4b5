// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The append-only channel log, stored as newline-delimited JSON.
//!
//! # Concurrency
//!
//! Appends serialize on an internal mutex so each JSONL line hits storage as
//! one atomic write. Reads go through [`ChannelStore::sync`], an incremental
//! parse of the bytes past the last consumed offset; a sync gate makes the
//! read single-flight — concurrent callers queue behind the leader and find
//! the cache already advanced, so their own incremental read is empty.
//!
//! # Robustness
//!
//! Malformed or truncated lines are skipped silently (logged at debug); a
//! partially appended trailing line is left unconsumed until its newline
//! arrives. This guarantees forward progress even when a reader races a
//! writer mid-line.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use worker_store::Storage;

use crate::message::{extract_mentions, visible_to, Message, MessageKind};
use crate::Result;

pub const CHANNEL_KEY: &str = "channel.jsonl";

/// Options for [`ChannelStore::append`].
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Direct-message recipient.
    pub to: Option<String>,
    /// Entry kind; defaults to `message`.
    pub kind: Option<MessageKind>,
}

/// Options for [`ChannelStore::read`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Apply the agent visibility filter for this agent.
    pub agent: Option<String>,
    /// Only entries strictly after this timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Keep only the last `limit` entries (after filtering).
    pub limit: Option<usize>,
}

#[derive(Default)]
struct ChannelCache {
    entries: Vec<Message>,
    offset: u64,
}

/// Append-only ordered message log for one workflow instance.
pub struct ChannelStore {
    storage: Arc<dyn Storage>,
    key: String,
    valid_agents: Vec<String>,
    /// Serializes appends so individual JSONL lines stay whole.
    append_gate: Mutex<()>,
    /// Serializes incremental syncs (single-flight).
    sync_gate: Mutex<()>,
    cache: Mutex<ChannelCache>,
}

impl ChannelStore {
    pub fn new(storage: Arc<dyn Storage>, valid_agents: Vec<String>) -> Self {
        Self {
            storage,
            key: CHANNEL_KEY.to_string(),
            valid_agents,
            append_gate: Mutex::new(()),
            sync_gate: Mutex::new(()),
            cache: Mutex::new(ChannelCache::default()),
        }
    }

    pub fn valid_agents(&self) -> &[String] {
        &self.valid_agents
    }

    /// Append one message. Assigns id and timestamp, extracts mentions
    /// against the workflow's valid-agent set, writes one JSONL line.
    pub async fn append(
        &self,
        from: &str,
        content: &str,
        opts: AppendOptions,
    ) -> Result<Message> {
        let msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            from: from.to_string(),
            content: content.to_string(),
            mentions: extract_mentions(content, &self.valid_agents),
            to: opts.to,
            kind: opts.kind.unwrap_or_default(),
        };
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');

        let _gate = self.append_gate.lock().await;
        self.storage.append(&self.key, &line).await?;
        Ok(msg)
    }

    /// Incremental read: parse any JSONL bytes past the last consumed offset
    /// into the cache and return the full cached entry list.
    pub async fn sync(&self) -> Result<Vec<Message>> {
        let _gate = self.sync_gate.lock().await;

        let offset = self.cache.lock().await.offset;
        let chunk = self.storage.read_from(&self.key, offset).await?;

        let mut cache = self.cache.lock().await;
        if !chunk.content.is_empty() {
            // Consume only whole lines; a trailing partial line stays in the
            // file until its newline lands.
            let consumed = chunk.content.rfind('\n').map(|i| i + 1).unwrap_or(0);
            for line in chunk.content[..consumed].lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(line) {
                    Ok(msg) => cache.entries.push(msg),
                    Err(e) => debug!(error = %e, "skipping malformed channel line"),
                }
            }
            cache.offset = offset + consumed as u64;
        }
        Ok(cache.entries.clone())
    }

    /// Number of entries currently in the channel.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.sync().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Read with visibility / since / tail-limit filters applied.
    pub async fn read(&self, opts: ReadOptions) -> Result<Vec<Message>> {
        let mut entries = self.sync().await?;

        if let Some(agent) = &opts.agent {
            entries.retain(|m| visible_to(m, agent));
        }
        if let Some(since) = opts.since {
            entries.retain(|m| m.timestamp > since);
        }
        if let Some(limit) = opts.limit {
            if entries.len() > limit {
                entries.drain(..entries.len() - limit);
            }
        }
        Ok(entries)
    }

    /// Entries after index `cursor` plus the new cursor (= current length).
    /// Used by collaboration clients to poll incrementally.
    pub async fn tail(&self, cursor: usize) -> Result<(Vec<Message>, usize)> {
        let entries = self.sync().await?;
        let new_cursor = entries.len();
        let start = cursor.min(new_cursor);
        Ok((entries[start..].to_vec(), new_cursor))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use worker_store::MemoryStorage;

    fn store_with(agents: &[&str]) -> ChannelStore {
        ChannelStore::new(
            Arc::new(MemoryStorage::new()),
            agents.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn append_then_read_returns_entry() {
        let ch = store_with(&["alice"]);
        let msg = ch.append("user", "hello @alice", AppendOptions::default()).await.unwrap();
        assert_eq!(msg.mentions, vec!["alice"]);

        let entries = ch.read(ReadOptions::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, msg.id);
        assert_eq!(entries[0].content, "hello @alice");
    }

    #[tokio::test]
    async fn ids_are_unique_across_appends() {
        let ch = store_with(&[]);
        let a = ch.append("user", "one", AppendOptions::default()).await.unwrap();
        let b = ch.append("user", "two", AppendOptions::default()).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn read_applies_visibility_filter() {
        let ch = store_with(&["alice", "bob"]);
        ch.append("alice", "public", AppendOptions::default()).await.unwrap();
        ch.append(
            "alice",
            "private",
            AppendOptions { to: Some("bob".into()), ..Default::default() },
        )
        .await
        .unwrap();
        ch.append(
            "system",
            "debug copy",
            AppendOptions { kind: Some(MessageKind::Debug), ..Default::default() },
        )
        .await
        .unwrap();

        let carol_view = ch
            .read(ReadOptions { agent: Some("carol".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(carol_view.len(), 1);
        assert_eq!(carol_view[0].content, "public");

        let bob_view = ch
            .read(ReadOptions { agent: Some("bob".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(bob_view.len(), 2);

        // Unfiltered read sees everything, including the debug entry.
        let raw = ch.read(ReadOptions::default()).await.unwrap();
        assert_eq!(raw.len(), 3);
    }

    #[tokio::test]
    async fn read_limit_keeps_tail() {
        let ch = store_with(&[]);
        for i in 0..5 {
            ch.append("user", &format!("m{i}"), AppendOptions::default()).await.unwrap();
        }
        let tail = ch
            .read(ReadOptions { limit: Some(2), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m3");
        assert_eq!(tail[1].content, "m4");
    }

    #[tokio::test]
    async fn tail_returns_entries_after_cursor() {
        let ch = store_with(&[]);
        ch.append("user", "a", AppendOptions::default()).await.unwrap();
        ch.append("user", "b", AppendOptions::default()).await.unwrap();

        let (entries, cursor) = ch.tail(0).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(cursor, 2);

        ch.append("user", "c", AppendOptions::default()).await.unwrap();
        let (entries, cursor) = ch.tail(cursor).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "c");
        assert_eq!(cursor, 3);

        // Cursor past the end is clamped.
        let (entries, _) = ch.tail(99).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let storage = Arc::new(MemoryStorage::new());
        storage.append(CHANNEL_KEY, "{not json}\n").await.unwrap();
        let ch = ChannelStore::new(storage.clone(), vec![]);
        ch.append("user", "good", AppendOptions::default()).await.unwrap();

        let entries = ch.sync().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "good");
    }

    #[tokio::test]
    async fn partial_trailing_line_is_not_consumed() {
        let storage = Arc::new(MemoryStorage::new());
        let ch = ChannelStore::new(storage.clone(), vec![]);
        ch.append("user", "whole", AppendOptions::default()).await.unwrap();

        // Simulate a writer caught mid-line: no trailing newline yet.
        storage.append(CHANNEL_KEY, "{\"id\":\"partial").await.unwrap();
        let entries = ch.sync().await.unwrap();
        assert_eq!(entries.len(), 1);

        // The line completes (still malformed JSON → skipped), then a good
        // line lands and is picked up.
        storage.append(CHANNEL_KEY, "\n").await.unwrap();
        ch.append("user", "after", AppendOptions::default()).await.unwrap();
        let entries = ch.sync().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].content, "after");
    }

    #[tokio::test]
    async fn concurrent_appends_never_interleave() {
        let ch = Arc::new(store_with(&[]));
        let mut tasks = Vec::new();
        for i in 0..20 {
            let ch = Arc::clone(&ch);
            tasks.push(tokio::spawn(async move {
                ch.append("user", &format!("msg-{i}"), AppendOptions::default())
                    .await
                    .unwrap()
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        // Every line must parse back — interleaved writes would corrupt lines.
        let entries = ch.sync().await.unwrap();
        assert_eq!(entries.len(), 20);
        let ids: std::collections::HashSet<_> = entries.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids.len(), 20);
    }
}
