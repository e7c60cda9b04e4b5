// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Flat key/value storage over UTF-8 strings.
//!
//! Everything the daemon persists — channel logs, inbox cursors, documents,
//! resources, status — goes through the [`Storage`] trait. Keys are flat
//! slash-separated paths relative to a storage root. One extra operation
//! beyond the usual read/write/append/delete: [`Storage::read_from`], a
//! byte-offset incremental read used by the channel store to pick up only
//! the JSONL lines appended since the last sync.
//!
//! Two implementations:
//! - [`FileStorage`] — one file per key under a root directory.
//! - [`MemoryStorage`] — a hash map, backing tests and ephemeral workspaces.
//!
//! The composite stores depend only on the trait; which implementation backs
//! a workspace is a configuration switch.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use thiserror::Error;

/// Result of an incremental read: the bytes past the requested offset and
/// the offset to resume from next time.
#[derive(Debug, Clone)]
pub struct ReadChunk {
    pub content: String,
    pub new_offset: u64,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Flat key/value storage. All content is UTF-8 text.
///
/// `append` must be atomic at the OS append granularity so that concurrent
/// appenders never interleave within a single write — the channel store
/// relies on this for JSONL line integrity. Reads of unknown keys return
/// `Ok(None)`; only unrecoverable I/O errors are surfaced.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>>;

    /// Whole-value replace.
    async fn write(&self, key: &str, content: &str) -> Result<()>;

    /// Append to the value, creating it when missing.
    async fn append(&self, key: &str, content: &str) -> Result<()>;

    /// Best-effort delete; deleting an unknown key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> bool;

    /// Read everything past `offset` bytes. A missing key yields an empty
    /// chunk with the offset unchanged.
    async fn read_from(&self, key: &str, offset: u64) -> Result<ReadChunk>;

    /// Recursively enumerate keys under `prefix`, relative to the root.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Shared contract tests run against both implementations.
    async fn exercise_basic_ops(store: &dyn Storage) {
        assert_eq!(store.read("missing").await.unwrap(), None);
        assert!(!store.exists("missing").await);

        store.write("a/b.txt", "hello").await.unwrap();
        assert_eq!(store.read("a/b.txt").await.unwrap().as_deref(), Some("hello"));
        assert!(store.exists("a/b.txt").await);

        store.append("a/b.txt", " world").await.unwrap();
        assert_eq!(
            store.read("a/b.txt").await.unwrap().as_deref(),
            Some("hello world")
        );

        store.delete("a/b.txt").await.unwrap();
        assert_eq!(store.read("a/b.txt").await.unwrap(), None);
        // Deleting again is fine.
        store.delete("a/b.txt").await.unwrap();
    }

    async fn exercise_read_from(store: &dyn Storage) {
        // Missing key: empty chunk, offset unchanged.
        let chunk = store.read_from("log", 0).await.unwrap();
        assert_eq!(chunk.content, "");
        assert_eq!(chunk.new_offset, 0);

        store.append("log", "line1\n").await.unwrap();
        let chunk = store.read_from("log", 0).await.unwrap();
        assert_eq!(chunk.content, "line1\n");
        let mid = chunk.new_offset;

        store.append("log", "line2\n").await.unwrap();
        let chunk = store.read_from("log", mid).await.unwrap();
        assert_eq!(chunk.content, "line2\n");

        // Reading at the end yields nothing new.
        let chunk2 = store.read_from("log", chunk.new_offset).await.unwrap();
        assert_eq!(chunk2.content, "");
        assert_eq!(chunk2.new_offset, chunk.new_offset);
    }

    async fn exercise_list(store: &dyn Storage) {
        store.write("docs/notes.md", "n").await.unwrap();
        store.write("docs/sub/plan.md", "p").await.unwrap();
        store.write("other/x.txt", "x").await.unwrap();

        let mut keys = store.list("docs").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["docs/notes.md", "docs/sub/plan.md"]);

        // Unknown prefix lists nothing.
        assert!(store.list("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_storage_contract() {
        let store = MemoryStorage::new();
        exercise_basic_ops(&store).await;
        exercise_read_from(&store).await;
        exercise_list(&store).await;
    }

    #[tokio::test]
    async fn file_storage_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStorage::new(dir.path());
        exercise_basic_ops(&store).await;
        exercise_read_from(&store).await;
        exercise_list(&store).await;
    }

    #[tokio::test]
    async fn file_storage_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStorage::new(dir.path());
        let err = store.write("../escape.txt", "x").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
