// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! In-memory storage backing tests and ephemeral workspaces.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{ReadChunk, Result, Storage};

/// Hash-map storage. Cheap to construct, nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn write(&self, key: &str, content: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), content.to_string());
        Ok(())
    }

    async fn append(&self, key: &str, content: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_str(content);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    async fn read_from(&self, key: &str, offset: u64) -> Result<ReadChunk> {
        let entries = self.entries.lock().unwrap();
        let Some(value) = entries.get(key) else {
            return Ok(ReadChunk {
                content: String::new(),
                new_offset: offset,
            });
        };
        let total = value.len() as u64;
        if offset >= total {
            return Ok(ReadChunk {
                content: String::new(),
                new_offset: total.max(offset),
            });
        }
        // Offsets always come from a previous read_from, so they land on the
        // boundary of a previous append and therefore on a char boundary.
        let content = value
            .get(offset as usize..)
            .unwrap_or_default()
            .to_string();
        Ok(ReadChunk {
            content,
            new_offset: total,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let needle = format!("{}/", prefix.trim_end_matches('/'));
        Ok(self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&needle))
            .cloned()
            .collect())
    }
}
