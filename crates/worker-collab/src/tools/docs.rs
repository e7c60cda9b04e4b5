// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use worker_context::DEFAULT_DOCUMENT;

use crate::tool::{optional_str, required_str, CollabTool, ToolCtx};

fn doc_path(args: &Value) -> String {
    optional_str(args, "path").unwrap_or_else(|| DEFAULT_DOCUMENT.to_string())
}

fn path_schema() -> Value {
    json!({
        "type": "string",
        "description": "Document path; defaults to notes.md"
    })
}

/// Read a shared team document.
pub struct TeamDocReadTool;

#[async_trait]
impl CollabTool for TeamDocReadTool {
    fn name(&self) -> &str {
        "team_doc_read"
    }

    fn description(&self) -> &str {
        "Read a shared team document. Defaults to notes.md."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": path_schema() },
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let path = doc_path(&args);
        let content = ctx.provider.documents().read(&path).await?;
        Ok(json!({ "path": path, "content": content }))
    }
}

/// Replace a shared team document.
pub struct TeamDocWriteTool;

#[async_trait]
impl CollabTool for TeamDocWriteTool {
    fn name(&self) -> &str {
        "team_doc_write"
    }

    fn description(&self) -> &str {
        "Replace the content of a shared team document (created if missing)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": path_schema(),
                "content": { "type": "string" }
            },
            "required": ["content"],
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let path = doc_path(&args);
        let content = required_str(&args, "content")?;
        ctx.provider.documents().write(&path, &content).await?;
        Ok(json!({ "path": path, "ok": true }))
    }
}

/// Append to a shared team document.
pub struct TeamDocAppendTool;

#[async_trait]
impl CollabTool for TeamDocAppendTool {
    fn name(&self) -> &str {
        "team_doc_append"
    }

    fn description(&self) -> &str {
        "Append text to a shared team document (created if missing)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": path_schema(),
                "content": { "type": "string" }
            },
            "required": ["content"],
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let path = doc_path(&args);
        let content = required_str(&args, "content")?;
        ctx.provider.documents().append(&path, &content).await?;
        Ok(json!({ "path": path, "ok": true }))
    }
}

/// List the shared documents.
pub struct TeamDocListTool;

#[async_trait]
impl CollabTool for TeamDocListTool {
    fn name(&self) -> &str {
        "team_doc_list"
    }

    fn description(&self) -> &str {
        "List all shared team documents."
    }

    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    async fn call(&self, ctx: &ToolCtx, _args: Value) -> anyhow::Result<Value> {
        Ok(json!({ "documents": ctx.provider.documents().list().await? }))
    }
}

/// Create a new shared document; fails when the path exists.
pub struct TeamDocCreateTool;

#[async_trait]
impl CollabTool for TeamDocCreateTool {
    fn name(&self) -> &str {
        "team_doc_create"
    }

    fn description(&self) -> &str {
        "Create a new shared team document. Fails if the path already exists."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string", "description": "Initial content (optional)" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let path = required_str(&args, "path")?;
        let content = optional_str(&args, "content").unwrap_or_default();
        ctx.provider.documents().create(&path, &content).await?;
        Ok(json!({ "path": path, "ok": true }))
    }
}
