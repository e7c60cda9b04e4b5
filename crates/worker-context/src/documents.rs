// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Shared document tree under `documents/`. Raw text keyed by path;
//! `notes.md` is the conventional entry point.

use std::sync::Arc;

use worker_store::Storage;

use crate::{ContextError, Result};

pub const DEFAULT_DOCUMENT: &str = "notes.md";

const DOCUMENTS_PREFIX: &str = "documents";

/// Extensions treated as binary and skipped by [`DocumentStore::list`].
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "ico", "pdf", "zip", "gz", "tar", "so", "o",
    "bin", "exe", "wasm",
];

pub struct DocumentStore {
    storage: Arc<dyn Storage>,
}

impl DocumentStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn key(path: &str) -> String {
        format!("{DOCUMENTS_PREFIX}/{}", path.trim_start_matches('/'))
    }

    /// Read a document; unknown paths yield `None`.
    pub async fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(self.storage.read(&Self::key(path)).await?)
    }

    /// Replace a document's content, creating it when missing.
    pub async fn write(&self, path: &str, content: &str) -> Result<()> {
        self.storage.write(&Self::key(path), content).await?;
        Ok(())
    }

    /// Append to a document, creating it when missing.
    pub async fn append(&self, path: &str, content: &str) -> Result<()> {
        self.storage.append(&Self::key(path), content).await?;
        Ok(())
    }

    /// Create a new document; fails when the path already exists.
    pub async fn create(&self, path: &str, content: &str) -> Result<()> {
        let key = Self::key(path);
        if self.storage.exists(&key).await {
            return Err(ContextError::AlreadyExists(path.to_string()));
        }
        self.storage.write(&key, content).await?;
        Ok(())
    }

    /// Recursively enumerate non-binary documents, paths relative to the
    /// documents root.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .storage
            .list(DOCUMENTS_PREFIX)
            .await?
            .into_iter()
            .filter(|k| {
                let ext = k.rsplit('.').next().unwrap_or("");
                !BINARY_EXTENSIONS.contains(&ext)
            })
            .filter_map(|k| {
                k.strip_prefix(&format!("{DOCUMENTS_PREFIX}/"))
                    .map(str::to_string)
            })
            .collect();
        paths.sort();
        Ok(paths)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
