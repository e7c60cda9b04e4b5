// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The daemon discovery file: `<config-dir>/daemon.json`.
//!
//! Written atomically (temp + rename) on start, removed on graceful
//! shutdown, and garbage-collected opportunistically by any client that
//! finds the recorded pid is no longer alive.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const DISCOVERY_FILE: &str = "daemon.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub pid: u32,
    pub host: String,
    pub port: u16,
    /// Epoch milliseconds.
    #[serde(rename = "startedAt")]
    pub started_at: i64,
    pub token: Option<String>,
}

impl DaemonInfo {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

pub fn discovery_path(config_dir: &Path) -> PathBuf {
    config_dir.join(DISCOVERY_FILE)
}

/// Write the discovery file atomically: the JSON lands in a temp sibling
/// first, then a rename makes it visible in one step.
pub fn write(config_dir: &Path, info: &DaemonInfo) -> anyhow::Result<()> {
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating {}", config_dir.display()))?;
    let path = discovery_path(config_dir);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(info)?;
    std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).with_context(|| format!("renaming into {}", path.display()))?;
    info!(path = %path.display(), pid = info.pid, "discovery file written");
    Ok(())
}

/// Remove the discovery file (graceful shutdown).
pub fn remove(config_dir: &Path) {
    let path = discovery_path(config_dir);
    match std::fs::remove_file(&path) {
        Ok(()) => info!(path = %path.display(), "discovery file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(error = %e, "could not remove discovery file"),
    }
}

/// Load the discovery file, garbage-collecting it when the recorded pid is
/// dead. Returns `None` when no live daemon is known.
pub fn load(config_dir: &Path) -> Option<DaemonInfo> {
    let path = discovery_path(config_dir);
    let text = std::fs::read_to_string(&path).ok()?;
    let info: DaemonInfo = match serde_json::from_str(&text) {
        Ok(info) => info,
        Err(e) => {
            debug!(error = %e, "malformed discovery file; removing");
            let _ = std::fs::remove_file(&path);
            return None;
        }
    };
    if !pid_alive(info.pid) {
        info!(pid = info.pid, "stale discovery file (dead pid); removing");
        let _ = std::fs::remove_file(&path);
        return None;
    }
    Some(info)
}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // Signal 0 performs the permission/existence check without delivering
    // anything. EPERM still means the process exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // No cheap probe; err on the side of "alive" so we never GC a live
    // daemon's discovery file.
    true
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pid: u32) -> DaemonInfo {
        DaemonInfo {
            pid,
            host: "127.0.0.1".into(),
            port: 7420,
            started_at: 1_700_000_000_000,
            token: Some("t".into()),
        }
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), &info(std::process::id())).unwrap();
        let loaded = load(dir.path()).expect("live daemon info");
        assert_eq!(loaded.pid, std::process::id());
        assert_eq!(loaded.port, 7420);
        assert_eq!(loaded.token.as_deref(), Some("t"));
    }

    #[test]
    fn stale_pid_is_garbage_collected() {
        let dir = tempfile::tempdir().unwrap();
        // Pid from far outside any plausible live range.
        write(dir.path(), &info(u32::MAX - 7)).unwrap();
        assert!(load(dir.path()).is_none());
        assert!(!discovery_path(dir.path()).exists());
    }

    #[test]
    fn malformed_file_is_garbage_collected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(discovery_path(dir.path()), "{broken").unwrap();
        assert!(load(dir.path()).is_none());
        assert!(!discovery_path(dir.path()).exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        remove(dir.path());
        write(dir.path(), &info(std::process::id())).unwrap();
        remove(dir.path());
        assert!(!discovery_path(dir.path()).exists());
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }
}
