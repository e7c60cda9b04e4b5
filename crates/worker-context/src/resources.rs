// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Content-addressed resources: immutable blobs with generated ids, used to
//! keep large payloads out of the channel.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use worker_store::Storage;

use crate::Result;

const RESOURCES_PREFIX: &str = "resources";

/// Probe order for [`ResourceStore::read`]. Fixed so a lookup by bare id
/// terminates deterministically.
const EXTENSION_PROBE_ORDER: &[&str] = &["md", "json", "diff", "txt"];

/// Type tag selecting the persisted extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    #[default]
    Text,
    Markdown,
    Json,
    Diff,
}

impl ResourceType {
    pub fn extension(self) -> &'static str {
        match self {
            ResourceType::Text => "txt",
            ResourceType::Markdown => "md",
            ResourceType::Json => "json",
            ResourceType::Diff => "diff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ResourceType::Text),
            "markdown" => Some(ResourceType::Markdown),
            "json" => Some(ResourceType::Json),
            "diff" => Some(ResourceType::Diff),
            _ => None,
        }
    }
}

pub struct ResourceStore {
    storage: Arc<dyn Storage>,
}

impl ResourceStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Create a resource and return its generated id (`res_` + 8 random
    /// lowercase alphanumerics). Resources are immutable once created.
    pub async fn create(&self, content: &str, ty: ResourceType) -> Result<String> {
        let id = generate_id();
        let key = format!("{RESOURCES_PREFIX}/{id}.{}", ty.extension());
        self.storage.write(&key, content).await?;
        Ok(id)
    }

    /// Read a resource by id, probing the known extensions in fixed order.
    pub async fn read(&self, id: &str) -> Result<Option<String>> {
        for ext in EXTENSION_PROBE_ORDER {
            let key = format!("{RESOURCES_PREFIX}/{id}.{ext}");
            if let Some(content) = self.storage.read(&key).await? {
                return Ok(Some(content));
            }
        }
        Ok(None)
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
    format!("res_{suffix}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
