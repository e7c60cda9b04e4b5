// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use worker_context::AgentState;

use crate::tool::{optional_str, required_str, CollabTool, ToolCtx};

/// Publish the caller's own status.
pub struct MyStatusSetTool;

#[async_trait]
impl CollabTool for MyStatusSetTool {
    fn name(&self) -> &str {
        "my_status_set"
    }

    fn description(&self) -> &str {
        "Set your status so teammates can see what you are doing. \
         'state' is one of idle, running, stopped; 'task' is a short \
         free-text description."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "state": { "type": "string", "enum": ["idle", "running", "stopped"] },
                "task": { "type": "string", "description": "What you are working on (optional)" }
            },
            "required": ["state"],
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let state = match required_str(&args, "state")?.as_str() {
            "idle" => AgentState::Idle,
            "running" => AgentState::Running,
            "stopped" => AgentState::Stopped,
            other => anyhow::bail!("unknown state {other:?} (expected idle|running|stopped)"),
        };
        let task = optional_str(&args, "task");
        ctx.provider.set_status(&ctx.caller, state, task).await?;
        Ok(json!({ "ok": true }))
    }
}

/// The registered agents of this workflow, with optional status.
pub struct TeamMembersTool;

#[async_trait]
impl CollabTool for TeamMembersTool {
    fn name(&self) -> &str {
        "team_members"
    }

    fn description(&self) -> &str {
        "List the agents registered in this workflow. Pass include_status \
         to also see each agent's current status."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "include_status": { "type": "boolean" }
            },
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let include_status = args
            .get("include_status")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !include_status {
            return Ok(json!({ "members": ctx.agents() }));
        }
        let statuses = ctx.provider.all_status().await?;
        let members: Vec<Value> = ctx
            .agents()
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "status": statuses.get(name).map(|s| serde_json::to_value(s).ok()),
                })
            })
            .collect();
        Ok(json!({ "members": members }))
    }
}
