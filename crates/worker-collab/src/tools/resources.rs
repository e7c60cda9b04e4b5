// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use worker_context::ResourceType;

use crate::tool::{optional_str, required_str, CollabTool, ToolCtx};

/// Store a large payload as a resource and get back its id.
pub struct ResourceCreateTool;

#[async_trait]
impl CollabTool for ResourceCreateTool {
    fn name(&self) -> &str {
        "resource_create"
    }

    fn description(&self) -> &str {
        "Store content as a shared resource and return its id. Use this for \
         large payloads instead of pasting them into the channel. 'type' is \
         one of text, markdown, json, diff."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string" },
                "type": { "type": "string", "enum": ["text", "markdown", "json", "diff"] }
            },
            "required": ["content"],
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let content = required_str(&args, "content")?;
        let ty = match optional_str(&args, "type") {
            Some(raw) => ResourceType::parse(&raw)
                .ok_or_else(|| anyhow::anyhow!("unknown resource type {raw:?}"))?,
            None => ResourceType::Text,
        };
        let id = ctx.provider.resources().create(&content, ty).await?;
        Ok(json!({ "id": id }))
    }
}

/// Fetch a resource by id.
pub struct ResourceReadTool;

#[async_trait]
impl CollabTool for ResourceReadTool {
    fn name(&self) -> &str {
        "resource_read"
    }

    fn description(&self) -> &str {
        "Read a shared resource by its id (res_...)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "required": ["id"],
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let id = required_str(&args, "id")?;
        match ctx.provider.resources().read(&id).await? {
            Some(content) => Ok(json!({ "id": id, "content": content })),
            None => anyhow::bail!("resource {id} not found"),
        }
    }
}
