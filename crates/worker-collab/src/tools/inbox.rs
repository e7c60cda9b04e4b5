// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{optional_str, CollabTool, ToolCtx};

/// The caller's unread inbox.
pub struct MyInboxTool;

#[async_trait]
impl CollabTool for MyInboxTool {
    fn name(&self) -> &str {
        "my_inbox"
    }

    fn description(&self) -> &str {
        "List your unread inbox: channel messages that mention you or were \
         sent directly to you, which you have not acknowledged yet."
    }

    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    async fn call(&self, ctx: &ToolCtx, _args: Value) -> anyhow::Result<Value> {
        let items = ctx.provider.get_inbox(&ctx.caller).await?;
        Ok(serde_json::to_value(items)?)
    }
}

/// Acknowledge inbox items up to a message id.
pub struct MyInboxAckTool;

#[async_trait]
impl CollabTool for MyInboxAckTool {
    fn name(&self) -> &str {
        "my_inbox_ack"
    }

    fn description(&self) -> &str {
        "Acknowledge your inbox. Without 'until', acknowledges everything \
         currently in it; with 'until', acknowledges up to that message id."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "until": { "type": "string", "description": "Message id to ack up to (optional)" }
            },
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let until = match optional_str(&args, "until") {
            Some(id) => Some(id),
            None => ctx
                .provider
                .get_inbox(&ctx.caller)
                .await?
                .last()
                .map(|item| item.message.id.clone()),
        };
        match until {
            Some(id) => {
                ctx.provider.ack(&ctx.caller, &id).await?;
                Ok(json!({ "acked": id }))
            }
            None => Ok(json!({ "acked": Value::Null })),
        }
    }
}
