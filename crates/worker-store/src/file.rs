// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! File-backed storage: one file per key under a root directory.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::{ReadChunk, Result, Storage, StorageError};

/// Storage rooted at a directory. Keys are relative slash paths; parent
/// directories are created on demand.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to an absolute path, rejecting anything that would
    /// escape the root (`..`, absolute paths, drive prefixes).
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let escapes = rel.components().any(|c| {
            !matches!(c, Component::Normal(_) | Component::CurDir)
        });
        if key.is_empty() || escapes {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn io_err(key: &str, source: std::io::Error) -> StorageError {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }

    async fn ensure_parent(&self, key: &str, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err(key, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.resolve(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(key, e)),
        }
    }

    async fn write(&self, key: &str, content: &str) -> Result<()> {
        let path = self.resolve(key)?;
        self.ensure_parent(key, &path).await?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| Self::io_err(key, e))
    }

    async fn append(&self, key: &str, content: &str) -> Result<()> {
        let path = self.resolve(key)?;
        self.ensure_parent(key, &path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Self::io_err(key, e))?;
        // A single write_all on an O_APPEND fd is atomic at the OS append
        // granularity, which keeps concurrently appended JSONL lines whole.
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| Self::io_err(key, e))?;
        file.flush().await.map_err(|e| Self::io_err(key, e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(key, e)),
        }
    }

    async fn exists(&self, key: &str) -> bool {
        match self.resolve(key) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn read_from(&self, key: &str, offset: u64) -> Result<ReadChunk> {
        let path = self.resolve(key)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReadChunk {
                    content: String::new(),
                    new_offset: offset,
                });
            }
            Err(e) => return Err(Self::io_err(key, e)),
        };
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Self::io_err(key, e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| Self::io_err(key, e))?;
        let read = buf.len() as u64;
        let content = String::from_utf8_lossy(&buf).into_owned();
        Ok(ReadChunk {
            content,
            new_offset: offset + read,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.resolve(prefix)?;
        if !base.is_dir() {
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        // walkdir is synchronous; enumeration runs on the blocking pool.
        let keys = tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            for entry in walkdir::WalkDir::new(&base)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&root) {
                    keys.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
            keys
        })
        .await
        .map_err(|e| Self::io_err(prefix, std::io::Error::other(e)))?;
        Ok(keys)
    }
}
