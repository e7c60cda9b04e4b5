// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Adapter from the collaboration registry to the backend [`ToolSet`] seam,
//! pinning the caller identity so an in-process backend can only act as the
//! agent its loop runs for.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use worker_backend::{ToolSchema, ToolSet};

use crate::registry::CollabRegistry;

pub struct RegistryToolSet {
    registry: Arc<CollabRegistry>,
    caller: String,
}

impl RegistryToolSet {
    pub fn new(registry: Arc<CollabRegistry>, caller: impl Into<String>) -> Self {
        Self {
            registry,
            caller: caller.into(),
        }
    }
}

#[async_trait]
impl ToolSet for RegistryToolSet {
    fn schemas(&self) -> Vec<ToolSchema> {
        self.registry.schemas()
    }

    async fn invoke(&self, name: &str, args: Value) -> anyhow::Result<Value> {
        let outcome = self.registry.execute(&self.caller, name, args).await;
        if outcome.is_error {
            anyhow::bail!("{}", outcome.content.as_str().unwrap_or("tool error"));
        }
        Ok(outcome.content)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
