// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The explicit tool table: `name → tool`, built once per workspace.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use worker_backend::ToolSchema;
use worker_context::ContextProvider;

use crate::tool::{CollabTool, ToolCtx};
use crate::tools::*;

/// The result of executing one tool call. Errors are values, not transport
/// failures — a failing tool is reported back on the protocol's error
/// channel and never tears down a session.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: Value,
    pub is_error: bool,
}

impl ToolOutcome {
    fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    fn err(msg: impl Into<String>) -> Self {
        Self {
            content: Value::String(msg.into()),
            is_error: true,
        }
    }
}

/// Table of collaboration tools bound to one workflow's context.
pub struct CollabRegistry {
    provider: Arc<ContextProvider>,
    tools: HashMap<String, Arc<dyn CollabTool>>,
}

impl CollabRegistry {
    pub fn provider(&self) -> &Arc<ContextProvider> {
        &self.provider
    }

    /// Registered agent names (the valid tool-session identities).
    pub fn agents(&self) -> &[String] {
        self.provider.agents()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Execute one call on behalf of `caller`.
    pub async fn execute(&self, caller: &str, name: &str, args: Value) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome::err(format!("unknown tool: {name}"));
        };
        let ctx = ToolCtx {
            caller: caller.to_string(),
            provider: Arc::clone(&self.provider),
        };
        debug!(caller, tool = name, "collab tool call");
        match tool.call(&ctx, args).await {
            Ok(content) => ToolOutcome::ok(content),
            Err(e) => ToolOutcome::err(e.to_string()),
        }
    }
}

/// Build the full tool table over one context provider. Constructed once at
/// workspace boot; the set is static afterwards.
pub fn build_collab_registry(provider: Arc<ContextProvider>) -> CollabRegistry {
    let mut tools: HashMap<String, Arc<dyn CollabTool>> = HashMap::new();

    fn register(map: &mut HashMap<String, Arc<dyn CollabTool>>, tool: impl CollabTool + 'static) {
        map.insert(tool.name().to_string(), Arc::new(tool));
    }

    register(&mut tools, ChannelSendTool);
    register(&mut tools, ChannelReadTool);
    register(&mut tools, MyInboxTool);
    register(&mut tools, MyInboxAckTool);
    register(&mut tools, MyStatusSetTool);
    register(&mut tools, TeamMembersTool);
    register(&mut tools, TeamDocReadTool);
    register(&mut tools, TeamDocWriteTool);
    register(&mut tools, TeamDocAppendTool);
    register(&mut tools, TeamDocListTool);
    register(&mut tools, TeamDocCreateTool);
    register(&mut tools, ResourceCreateTool);
    register(&mut tools, ResourceReadTool);
    register(&mut tools, TeamProposalCreateTool);
    register(&mut tools, TeamProposalVoteTool);
    register(&mut tools, TeamProposalStatusTool);
    register(&mut tools, TeamProposalCancelTool);

    CollabRegistry { provider, tools }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use worker_store::MemoryStorage;

    fn registry(agents: &[&str]) -> CollabRegistry {
        let provider = Arc::new(ContextProvider::new(
            Arc::new(MemoryStorage::new()),
            agents.iter().map(|s| s.to_string()).collect(),
        ));
        build_collab_registry(provider)
    }

    #[test]
    fn registry_contains_the_full_surface() {
        let reg = registry(&["alice"]);
        let names = reg.names();
        for expected in [
            "channel_send",
            "channel_read",
            "my_inbox",
            "my_inbox_ack",
            "my_status_set",
            "team_members",
            "team_doc_read",
            "team_doc_write",
            "team_doc_append",
            "team_doc_list",
            "team_doc_create",
            "resource_create",
            "resource_read",
            "team_proposal_create",
            "team_proposal_vote",
            "team_proposal_status",
            "team_proposal_cancel",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn schemas_are_sorted_and_complete() {
        let reg = registry(&[]);
        let schemas = reg.schemas();
        assert_eq!(schemas.len(), reg.names().len());
        let names: Vec<_> = schemas.iter().map(|s| s.name.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_outcome() {
        let reg = registry(&[]);
        let out = reg.execute("alice", "bogus_tool", json!({})).await;
        assert!(out.is_error);
        assert!(out.content.as_str().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn channel_send_and_inbox_round_trip() {
        let reg = registry(&["alice", "bob"]);
        let out = reg
            .execute("alice", "channel_send", json!({"message": "@bob hello"}))
            .await;
        assert!(!out.is_error, "{:?}", out.content);

        let inbox = reg.execute("bob", "my_inbox", json!({})).await;
        let items = inbox.content.as_array().unwrap();
        assert_eq!(items.len(), 1);

        let acked = reg.execute("bob", "my_inbox_ack", json!({})).await;
        assert!(!acked.is_error);
        let inbox = reg.execute("bob", "my_inbox", json!({})).await;
        assert!(inbox.content.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ack_on_empty_inbox_is_a_null_noop() {
        let reg = registry(&["alice"]);
        let out = reg.execute("alice", "my_inbox_ack", json!({})).await;
        assert!(!out.is_error);
        assert!(out.content.get("acked").unwrap().is_null());
    }

    #[tokio::test]
    async fn doc_tools_round_trip() {
        let reg = registry(&["alice"]);
        reg.execute("alice", "team_doc_write", json!({"content": "hello"})).await;
        let read = reg.execute("alice", "team_doc_read", json!({})).await;
        assert_eq!(read.content["content"], "hello");

        let create_again = reg
            .execute("alice", "team_doc_create", json!({"path": "notes.md"}))
            .await;
        assert!(create_again.is_error);
    }

    #[tokio::test]
    async fn failing_tool_reports_error_not_panic() {
        let reg = registry(&[]);
        let out = reg
            .execute("alice", "resource_read", json!({"id": "res_nothere0"}))
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn proposal_tools_drive_the_ledger() {
        let reg = registry(&["alice", "bob", "carol"]);
        let created = reg
            .execute("alice", "team_proposal_create", json!({"title": "merge"}))
            .await;
        let id = created.content["id"].as_str().unwrap().to_string();

        let voted = reg
            .execute("bob", "team_proposal_vote", json!({"id": id, "vote": "approve"}))
            .await;
        assert_eq!(voted.content["status"], "passed");
    }
}
