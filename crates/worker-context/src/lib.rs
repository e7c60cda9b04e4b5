// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Shared context for a group of collaborating agents.
//!
//! One workflow instance (a `name:tag` pair) owns one context: an
//! append-only channel log, per-agent inboxes gated by cursors, a document
//! tree, content-addressed resources, agent status, a timeline event log and
//! an optional proposal ledger. All of it is persisted through a
//! [`worker_store::Storage`] implementation so a file-backed context
//! survives daemon restarts while tests and ephemeral agents run on the
//! in-memory variant.
//!
//! [`ContextProvider`] is the façade the rest of the system talks to. The
//! stores never call each other; the only cross-store logic is
//! [`ContextProvider::smart_send`], which offloads oversized messages into
//! resources.

mod channel;
mod documents;
mod inbox;
mod message;
mod proposals;
mod provider;
mod resources;
mod status;
mod timeline;

pub use channel::{AppendOptions, ChannelStore, ReadOptions};
pub use documents::{DocumentStore, DEFAULT_DOCUMENT};
pub use inbox::{InboxItem, InboxStore, Priority};
pub use message::{extract_mentions, visible_to, Message, MessageKind};
pub use proposals::{Proposal, ProposalStatus, ProposalStore, Vote};
pub use provider::{ContextProvider, SmartSendOptions, RESOURCE_THRESHOLD};
pub use resources::{ResourceStore, ResourceType};
pub use status::{AgentState, AgentStatus, StatusStore};
pub use timeline::TimelineStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Storage(#[from] worker_store::StorageError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ContextError>;
