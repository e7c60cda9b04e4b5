// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! User-prompt assembly for agent turns.
//!
//! Each section is a pure function `&PromptContext → Option<String>`;
//! non-empty sections are joined with blank lines in one fixed canonical
//! order. The instructions section enumerates the available tool names from
//! the context — it is the single place the tool surface is described to
//! the model.

use worker_context::{InboxItem, Priority};

use crate::conversation::{ConversationMessage, Role};

/// Everything a turn's prompt can draw on.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    pub agent_name: &'a str,
    /// Free-text project description from the agent definition.
    pub project: Option<&'a str>,
    pub inbox: &'a [InboxItem],
    pub thin_thread: &'a [ConversationMessage],
    /// Entries in the recent channel window (visibility-filtered).
    pub recent_channel: usize,
    /// Open items in the agent's todo list.
    pub open_todos: usize,
    /// Content of the entry-point document (`notes.md` by default).
    pub document: Option<&'a str>,
    /// 1-based attempt number; the retry notice appears from attempt 2 on.
    pub attempt: u32,
    pub last_error: Option<&'a str>,
    /// Names of the collaboration tools available this turn.
    pub tool_names: &'a [String],
    /// `name:tag` of the owning workflow, when any.
    pub workflow: Option<&'a str>,
}

/// Canonical section order. Changing this changes every prompt the daemon
/// ever builds, so it lives in exactly one place.
pub fn assemble_user_prompt(ctx: &PromptContext<'_>) -> String {
    let sections = [
        project_section(ctx),
        inbox_section(ctx),
        thin_thread_section(ctx),
        activity_section(ctx),
        document_section(ctx),
        retry_section(ctx),
        instructions_section(ctx),
        workflow_section(ctx),
        exit_section(ctx),
    ];
    sections
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn project_section(ctx: &PromptContext<'_>) -> Option<String> {
    ctx.project.map(|p| format!("## Project\n{p}"))
}

fn inbox_section(ctx: &PromptContext<'_>) -> Option<String> {
    if ctx.inbox.is_empty() {
        return None;
    }
    let mut out = format!("## Inbox ({} unread)\n", ctx.inbox.len());
    for item in ctx.inbox {
        let marker = match item.priority {
            Priority::High => " [!]",
            Priority::Normal => "",
        };
        out.push_str(&format!(
            "- from {}{}: {}\n",
            item.message.from, marker, item.message.content
        ));
    }
    Some(out.trim_end().to_string())
}

fn thin_thread_section(ctx: &PromptContext<'_>) -> Option<String> {
    if ctx.thin_thread.is_empty() {
        return None;
    }
    let mut out = String::from("## Recent conversation\n");
    for msg in ctx.thin_thread {
        let who = match msg.role {
            Role::User => "user",
            Role::Assistant => "you",
            Role::System => "system",
        };
        out.push_str(&format!("{who}: {}\n", msg.content));
    }
    Some(out.trim_end().to_string())
}

fn activity_section(ctx: &PromptContext<'_>) -> Option<String> {
    if ctx.open_todos == 0 && ctx.recent_channel == 0 {
        return None;
    }
    let mut parts = Vec::new();
    if ctx.recent_channel > 0 {
        parts.push(format!(
            "{} message(s) in the recent channel window",
            ctx.recent_channel
        ));
    }
    if ctx.open_todos > 0 {
        parts.push(format!("{} open todo item(s)", ctx.open_todos));
    }
    Some(format!("## Activity\n{}.", parts.join("; ")))
}

fn document_section(ctx: &PromptContext<'_>) -> Option<String> {
    match ctx.document {
        Some(doc) if !doc.trim().is_empty() => Some(format!("## Team notes\n{doc}")),
        _ => None,
    }
}

fn retry_section(ctx: &PromptContext<'_>) -> Option<String> {
    if ctx.attempt <= 1 {
        return None;
    }
    let detail = ctx
        .last_error
        .map(|e| format!(" Previous error: {e}."))
        .unwrap_or_default();
    Some(format!(
        "## Retry notice\nThis is attempt {} at handling the same inbox.{detail} \
         Keep your response focused.",
        ctx.attempt
    ))
}

fn instructions_section(ctx: &PromptContext<'_>) -> Option<String> {
    let mut out = format!(
        "## Instructions\nYou are agent \"{}\". Read your inbox above and respond. \
         Mention teammates with @name to route messages to them.",
        ctx.agent_name
    );
    if !ctx.tool_names.is_empty() {
        out.push_str("\nAvailable tools: ");
        out.push_str(&ctx.tool_names.join(", "));
        out.push('.');
    }
    Some(out)
}

fn workflow_section(ctx: &PromptContext<'_>) -> Option<String> {
    ctx.workflow.map(|w| {
        format!(
            "## Workflow\nYou are part of workflow \"{w}\". Collaborate through \
             the shared channel; do not invent teammates."
        )
    })
}

fn exit_section(_ctx: &PromptContext<'_>) -> Option<String> {
    Some(
        "## When you are done\nReply with your result. If nothing needs doing, \
         reply briefly and stop — do not mention anyone unless you need them."
            .to_string(),
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
