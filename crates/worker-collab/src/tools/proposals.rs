// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use worker_context::Vote;

use crate::tool::{required_str, CollabTool, ToolCtx};

/// Open a proposal for the team to vote on.
pub struct TeamProposalCreateTool;

#[async_trait]
impl CollabTool for TeamProposalCreateTool {
    fn name(&self) -> &str {
        "team_proposal_create"
    }

    fn description(&self) -> &str {
        "Open a proposal for the team. You count as approving it; it passes \
         once a majority of agents approve. A workflow is not considered \
         finished while proposals are open."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "title": { "type": "string" } },
            "required": ["title"],
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let title = required_str(&args, "title")?;
        let proposal = ctx.provider.proposals().create(&ctx.caller, &title).await?;
        Ok(serde_json::to_value(proposal)?)
    }
}

/// Vote on an open proposal.
pub struct TeamProposalVoteTool;

#[async_trait]
impl CollabTool for TeamProposalVoteTool {
    fn name(&self) -> &str {
        "team_proposal_vote"
    }

    fn description(&self) -> &str {
        "Vote 'approve' or 'reject' on an open proposal by id."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "vote": { "type": "string", "enum": ["approve", "reject"] }
            },
            "required": ["id", "vote"],
            "additionalProperties": false
        })
    }

    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value> {
        let id = required_str(&args, "id")?;
        let vote = match required_str(&args, "vote")?.as_str() {
            "approve" => Vote::Approve,
            "reject" => Vote::Reject,
            other => anyhow::bail!("unknown vote {other:?} (expected approve|reject)"),
        };
        let proposal = ctx.provider.proposals().vote(&id, &ctx.caller, vote).await?;
        Ok(serde_json::to_value(proposal)?)
    }
}

/// Inspect a proposal.
pub struct TeamProposalStatusTool;

#[async_trait]
impl CollabTool for TeamProposalStatusTool {
    fn name(&self) -> &str {
        "team_proposal_status"
    }

    fn description(&self) -> &str {
        "Show a proposal's current status and votes."
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
        let proposal = ctx.provider.proposals().status(&id).await?;
        Ok(serde_json::to_value(proposal)?)
    }
}

/// Cancel a proposal you opened.
pub struct TeamProposalCancelTool;

#[async_trait]
impl CollabTool for TeamProposalCancelTool {
    fn name(&self) -> &str {
        "team_proposal_cancel"
    }

    fn description(&self) -> &str {
        "Cancel an open proposal. Only the proposer may cancel."
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
        let proposal = ctx.provider.proposals().cancel(&id, &ctx.caller).await?;
        Ok(serde_json::to_value(proposal)?)
    }
}
