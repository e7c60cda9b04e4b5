// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! [`ContextProvider`] — the façade over the composed stores.
//!
//! Everything above this crate (the agent loop, the collaboration tools,
//! the daemon) talks to the provider, never to individual stores. The
//! provider adds exactly one piece of cross-store orchestration:
//! [`ContextProvider::smart_send`], which reroutes oversized payloads into
//! a resource plus a short channel notice so the channel stays readable
//! while the full content is preserved.

use std::collections::HashMap;
use std::sync::Arc;

use worker_store::Storage;

use crate::channel::{AppendOptions, ChannelStore, ReadOptions};
use crate::documents::DocumentStore;
use crate::inbox::{InboxItem, InboxStore};
use crate::message::{extract_mentions, Message, MessageKind};
use crate::proposals::ProposalStore;
use crate::resources::{ResourceStore, ResourceType};
use crate::status::{AgentState, AgentStatus, StatusStore};
use crate::timeline::TimelineStore;
use crate::Result;

/// Messages longer than this are offloaded into a resource by
/// [`ContextProvider::smart_send`].
pub const RESOURCE_THRESHOLD: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct SmartSendOptions {
    pub to: Option<String>,
}

/// One workflow instance's shared context.
pub struct ContextProvider {
    agents: Vec<String>,
    channel: Arc<ChannelStore>,
    inbox: InboxStore,
    documents: DocumentStore,
    resources: ResourceStore,
    status: StatusStore,
    timeline: TimelineStore,
    proposals: ProposalStore,
}

impl ContextProvider {
    /// Compose all stores over one storage backend. `agents` is the set of
    /// valid mention targets for this workflow.
    pub fn new(storage: Arc<dyn Storage>, agents: Vec<String>) -> Self {
        let channel = Arc::new(ChannelStore::new(Arc::clone(&storage), agents.clone()));
        let inbox = InboxStore::new(Arc::clone(&storage), Arc::clone(&channel));
        Self {
            documents: DocumentStore::new(Arc::clone(&storage)),
            resources: ResourceStore::new(Arc::clone(&storage)),
            status: StatusStore::new(Arc::clone(&storage)),
            timeline: TimelineStore::new(Arc::clone(&storage)),
            proposals: ProposalStore::new(storage, agents.clone()),
            channel,
            inbox,
            agents,
        }
    }

    pub fn agents(&self) -> &[String] {
        &self.agents
    }

    // ── Channel ───────────────────────────────────────────────────────────────

    pub async fn append_channel(
        &self,
        from: &str,
        content: &str,
        opts: AppendOptions,
    ) -> Result<Message> {
        self.channel.append(from, content, opts).await
    }

    pub async fn read_channel(&self, opts: ReadOptions) -> Result<Vec<Message>> {
        self.channel.read(opts).await
    }

    pub async fn tail_channel(&self, cursor: usize) -> Result<(Vec<Message>, usize)> {
        self.channel.tail(cursor).await
    }

    pub async fn channel_len(&self) -> Result<usize> {
        self.channel.len().await
    }

    // ── Inbox ─────────────────────────────────────────────────────────────────

    pub async fn get_inbox(&self, agent: &str) -> Result<Vec<InboxItem>> {
        self.inbox.get_inbox(agent).await
    }

    pub async fn ack(&self, agent: &str, until_id: &str) -> Result<()> {
        self.inbox.ack(agent, until_id).await
    }

    pub async fn mark_seen(&self, agent: &str, until_id: &str) -> Result<()> {
        self.inbox.mark_seen(agent, until_id).await
    }

    pub async fn mark_run_start(&self) -> Result<()> {
        self.inbox.mark_run_start().await
    }

    // ── Documents / resources ─────────────────────────────────────────────────

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn resources(&self) -> &ResourceStore {
        &self.resources
    }

    // ── Status / timeline / proposals ─────────────────────────────────────────

    pub async fn set_status(
        &self,
        agent: &str,
        state: AgentState,
        task: Option<String>,
    ) -> Result<()> {
        self.status.set(agent, state, task).await
    }

    pub async fn get_status(&self, agent: &str) -> Result<Option<AgentStatus>> {
        self.status.get(agent).await
    }

    pub async fn all_status(&self) -> Result<HashMap<String, AgentStatus>> {
        self.status.all().await
    }

    pub fn timeline(&self) -> &TimelineStore {
        &self.timeline
    }

    pub fn proposals(&self) -> &ProposalStore {
        &self.proposals
    }

    pub async fn active_proposals(&self) -> Result<usize> {
        self.proposals.active_count().await
    }

    // ── Cross-store orchestration ─────────────────────────────────────────────

    /// Append a message, offloading oversized content into a resource.
    ///
    /// Short content (≤ [`RESOURCE_THRESHOLD`] chars) is appended directly.
    /// Longer content becomes three artifacts:
    /// 1. a resource holding the full payload (`markdown` when a fenced-code
    ///    marker is present, `text` otherwise);
    /// 2. a `debug`-kind channel copy of the full payload, hidden from agent
    ///    views but preserved in the log;
    /// 3. a short public notice carrying the original mentions (so routing
    ///    still works) and naming the resource id.
    ///
    /// Returns the message that agents will actually see.
    pub async fn smart_send(
        &self,
        from: &str,
        content: &str,
        opts: SmartSendOptions,
    ) -> Result<Message> {
        if content.chars().count() <= RESOURCE_THRESHOLD {
            return self
                .channel
                .append(
                    from,
                    content,
                    AppendOptions {
                        to: opts.to,
                        kind: None,
                    },
                )
                .await;
        }

        let ty = if content.contains("```") {
            ResourceType::Markdown
        } else {
            ResourceType::Text
        };
        let resource_id = self.resources.create(content, ty).await?;

        // Full copy for the log, invisible to agents.
        self.channel
            .append(
                from,
                content,
                AppendOptions {
                    to: opts.to.clone(),
                    kind: Some(MessageKind::Debug),
                },
            )
            .await?;

        let mentions = extract_mentions(content, &self.agents);
        let mut notice = String::new();
        for name in &mentions {
            notice.push('@');
            notice.push_str(name);
            notice.push(' ');
        }
        notice.push_str(&format!(
            "Sent a long message ({} chars), see resource:{resource_id}",
            content.chars().count()
        ));

        self.channel
            .append(
                from,
                &notice,
                AppendOptions {
                    to: opts.to,
                    kind: None,
                },
            )
            .await
    }

    /// Ephemeral-workspace teardown: clear transient inbox cursors. The
    /// channel and documents are always preserved.
    pub async fn destroy(&self) -> Result<()> {
        self.inbox.destroy().await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
