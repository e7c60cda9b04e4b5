// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use worker_context::{ReadOptions, SmartSendOptions};

use crate::tool::{optional_str, optional_u64, required_str, CollabTool, ToolCtx};

/// Post a message to the shared channel (smart-send: long payloads are
/// offloaded into a resource automatically).
pub struct ChannelSendTool;

#[async_trait]
impl CollabTool for ChannelSendTool {
    fn name(&self) -> &str {
        "channel_send"
    }

    fn description(&self) -> &str {
        "Send a message to the team channel. Mention agents with @name to \
         notify them. Pass 'to' for a direct message only the recipient can \
         see. Long messages are stored as a resource and a short notice is \
         posted instead."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string", "description": "Message text" },
                "to": { "type": "string", "description": "Direct-message recipient (optional)" }
            },
            "required": ["message"],
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let message = required_str(&args, "message")?;
        let to = optional_str(&args, "to");
        let msg = ctx
            .provider
            .smart_send(&ctx.caller, &message, SmartSendOptions { to })
            .await?;
        Ok(json!({ "id": msg.id, "content": msg.content, "mentions": msg.mentions }))
    }
}

/// Read the channel through the caller's visibility filter.
pub struct ChannelReadTool;

#[async_trait]
impl CollabTool for ChannelReadTool {
    fn name(&self) -> &str {
        "channel_read"
    }

    fn description(&self) -> &str {
        "Read recent team channel messages. 'limit' keeps only the newest N \
         entries; 'since' (ISO-8601) keeps entries after that time."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Max entries to return" },
                "since": { "type": "string", "description": "ISO-8601 lower bound (exclusive)" }
            },
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let since = match optional_str(&args, "since") {
            Some(raw) => Some(
                raw.parse::<chrono::DateTime<chrono::Utc>>()
                    .map_err(|e| anyhow::anyhow!("invalid 'since' timestamp: {e}"))?,
            ),
            None => None,
        };
        let entries = ctx
            .provider
            .read_channel(ReadOptions {
                agent: Some(ctx.caller.clone()),
                since,
                limit: optional_u64(&args, "limit").map(|n| n as usize),
            })
            .await?;
        Ok(serde_json::to_value(entries)?)
    }
}
