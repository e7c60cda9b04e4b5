// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Team proposals: a small voting ledger over the workflow's agent set.
//!
//! A proposal is decided by strict majority of the registered agents; the
//! proposer counts as an approval. Open proposals keep a workflow alive —
//! the idle detector treats `active_count() > 0` as "not done yet".

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use worker_store::Storage;

use crate::{ContextError, Result};

pub const PROPOSALS_KEY: &str = "_state/proposals.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Open,
    Passed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub title: String,
    pub proposer: String,
    pub created_at: DateTime<Utc>,
    pub status: ProposalStatus,
    pub votes: HashMap<String, Vote>,
}

pub struct ProposalStore {
    storage: Arc<dyn Storage>,
    /// Total voter count used for the majority threshold.
    agents: Vec<String>,
    doc_gate: Mutex<()>,
}

impl ProposalStore {
    pub fn new(storage: Arc<dyn Storage>, agents: Vec<String>) -> Self {
        Self {
            storage,
            agents,
            doc_gate: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<Proposal>> {
        match self.storage.read(PROPOSALS_KEY).await? {
            Some(text) => Ok(serde_json::from_str(&text).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, proposals: &[Proposal]) -> Result<()> {
        let text = serde_json::to_string_pretty(proposals)?;
        self.storage.write(PROPOSALS_KEY, &text).await?;
        Ok(())
    }

    pub async fn create(&self, proposer: &str, title: &str) -> Result<Proposal> {
        let _gate = self.doc_gate.lock().await;
        let mut proposals = self.load().await?;
        let mut votes = HashMap::new();
        votes.insert(proposer.to_string(), Vote::Approve);
        let proposal = Proposal {
            id: generate_id(),
            title: title.to_string(),
            proposer: proposer.to_string(),
            created_at: Utc::now(),
            status: ProposalStatus::Open,
            votes,
        };
        proposals.push(proposal.clone());
        self.save(&proposals).await?;
        Ok(proposal)
    }

    /// Cast or replace a vote, then re-tally. Voting on a decided proposal
    /// is a conflict.
    pub async fn vote(&self, id: &str, agent: &str, vote: Vote) -> Result<Proposal> {
        let _gate = self.doc_gate.lock().await;
        let mut proposals = self.load().await?;
        let total_voters = self.agents.len().max(1);
        let proposal = proposals
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ContextError::NotFound(format!("proposal {id}")))?;
        if proposal.status != ProposalStatus::Open {
            return Err(ContextError::Conflict(format!(
                "proposal {id} is already {:?}",
                proposal.status
            )));
        }
        proposal.votes.insert(agent.to_string(), vote);

        let approvals = proposal.votes.values().filter(|v| **v == Vote::Approve).count();
        let rejections = proposal.votes.len() - approvals;
        if approvals * 2 > total_voters {
            proposal.status = ProposalStatus::Passed;
        } else if rejections * 2 >= total_voters {
            proposal.status = ProposalStatus::Failed;
        }

        let snapshot = proposal.clone();
        self.save(&proposals).await?;
        Ok(snapshot)
    }

    pub async fn status(&self, id: &str) -> Result<Proposal> {
        self.load()
            .await?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| ContextError::NotFound(format!("proposal {id}")))
    }

    /// Cancel an open proposal. Only the proposer may cancel.
    pub async fn cancel(&self, id: &str, by: &str) -> Result<Proposal> {
        let _gate = self.doc_gate.lock().await;
        let mut proposals = self.load().await?;
        let proposal = proposals
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ContextError::NotFound(format!("proposal {id}")))?;
        if proposal.proposer != by {
            return Err(ContextError::Conflict(format!(
                "only the proposer may cancel proposal {id}"
            )));
        }
        if proposal.status != ProposalStatus::Open {
            return Err(ContextError::Conflict(format!(
                "proposal {id} is already {:?}",
                proposal.status
            )));
        }
        proposal.status = ProposalStatus::Cancelled;
        let snapshot = proposal.clone();
        self.save(&proposals).await?;
        Ok(snapshot)
    }

    pub async fn list(&self) -> Result<Vec<Proposal>> {
        self.load().await
    }

    /// Number of open proposals. Feeds workflow idle detection.
    pub async fn active_count(&self) -> Result<usize> {
        Ok(self
            .load()
            .await?
            .iter()
            .filter(|p| p.status == ProposalStatus::Open)
            .count())
    }
}

fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
            chars[rng.gen_range(0..chars.len())] as char
        })
        .collect();
    format!("prop_{suffix}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
