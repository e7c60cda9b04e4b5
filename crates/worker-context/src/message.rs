// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The channel message model: kinds, visibility rules, mention extraction.
//!
//! Visibility is defined in exactly one place ([`visible_to`]) and reused by
//! every channel read path, so an agent can never see a `debug` copy through
//! one API and not another.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Classifies a channel entry. Everything except `message` and `log` is
/// hidden from agent-filtered reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Message,
    System,
    Debug,
    Output,
    ToolCall,
    Log,
}

/// One immutable channel entry. Appended once, never modified or deleted.
///
/// `id` is the ordering key; timestamps are best-effort non-decreasing but
/// carry no correctness weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    /// Direct-message recipient; restricts visibility to `from` and `to`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "kind_is_default")]
    pub kind: MessageKind,
}

fn kind_is_default(kind: &MessageKind) -> bool {
    *kind == MessageKind::Message
}

impl Message {
    pub fn new(from: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            from: from.into(),
            content: content.into(),
            mentions: Vec::new(),
            to: None,
            kind: MessageKind::Message,
        }
    }
}

/// Whether `agent` may see `msg` when reading the channel.
///
/// - kinds `system`, `debug` and `output` are hidden from agents;
/// - direct messages are visible only to sender and recipient;
/// - everything else is public.
pub fn visible_to(msg: &Message, agent: &str) -> bool {
    match msg.kind {
        MessageKind::System | MessageKind::Debug | MessageKind::Output => return false,
        _ => {}
    }
    match &msg.to {
        Some(to) => to == agent || msg.from == agent,
        None => true,
    }
}

fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([A-Za-z0-9_-]+)").expect("mention regex"))
}

/// Extract `@name` mentions from `content`, intersected with the workflow's
/// valid-agent set. Case-sensitive; first occurrence wins; duplicates are
/// dropped; order of first occurrence is preserved.
pub fn extract_mentions(content: &str, valid_agents: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for cap in mention_regex().captures_iter(content) {
        let name = &cap[1];
        if valid_agents.iter().any(|a| a == name) && !out.iter().any(|m| m == name) {
            out.push(name.to_string());
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn agents(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // ── Mention extraction ────────────────────────────────────────────────────

    #[test]
    fn mentions_only_valid_agents() {
        let found = extract_mentions("@alice meet @mallory", &agents(&["alice", "bob"]));
        assert_eq!(found, vec!["alice"]);
    }

    #[test]
    fn mentions_preserve_first_occurrence_order() {
        let found = extract_mentions("@bob then @alice then @bob", &agents(&["alice", "bob"]));
        assert_eq!(found, vec!["bob", "alice"]);
    }

    #[test]
    fn mentions_are_case_sensitive() {
        let found = extract_mentions("@Alice @alice", &agents(&["alice"]));
        assert_eq!(found, vec!["alice"]);
    }

    #[test]
    fn mentions_empty_when_no_match() {
        assert!(extract_mentions("nothing here", &agents(&["alice"])).is_empty());
    }

    #[test]
    fn mentions_handle_punctuation_boundaries() {
        let found = extract_mentions("ping @alice, and @bob.", &agents(&["alice", "bob"]));
        assert_eq!(found, vec!["alice", "bob"]);
    }

    // ── Visibility ────────────────────────────────────────────────────────────

    #[test]
    fn public_message_visible_to_anyone() {
        let msg = Message::new("alice", "hello");
        assert!(visible_to(&msg, "bob"));
        assert!(visible_to(&msg, "alice"));
    }

    #[test]
    fn hidden_kinds_are_invisible() {
        for kind in [MessageKind::System, MessageKind::Debug, MessageKind::Output] {
            let mut msg = Message::new("system", "internal");
            msg.kind = kind;
            assert!(!visible_to(&msg, "alice"), "{kind:?} must be hidden");
        }
    }

    #[test]
    fn log_and_tool_call_kinds_pass_visibility() {
        // tool_call is excluded by the inbox filter, not by visibility.
        for kind in [MessageKind::Log, MessageKind::ToolCall] {
            let mut msg = Message::new("alice", "x");
            msg.kind = kind;
            assert!(visible_to(&msg, "bob"));
        }
    }

    #[test]
    fn dm_visible_only_to_sender_and_recipient() {
        let mut msg = Message::new("alice", "psst");
        msg.to = Some("bob".into());
        assert!(visible_to(&msg, "alice"));
        assert!(visible_to(&msg, "bob"));
        assert!(!visible_to(&msg, "carol"));
    }

    // ── Serialization ─────────────────────────────────────────────────────────

    #[test]
    fn default_kind_omitted_on_wire() {
        let msg = Message::new("alice", "hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("\"kind\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, MessageKind::Message);
    }

    #[test]
    fn kind_round_trips_snake_case() {
        let mut msg = Message::new("alice", "hi");
        msg.kind = MessageKind::ToolCall;
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"tool_call\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, MessageKind::ToolCall);
    }
}
