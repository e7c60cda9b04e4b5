// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Daemon configuration: layered YAML merge, lowest priority first.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_PORT: u16 = 7420;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    /// Shared bearer token; `None` disables the auth check.
    pub token: Option<String>,
    /// Root for agents, workflows, and the discovery file. Defaults to
    /// `~/.agent-worker`.
    pub config_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            token: None,
            config_dir: None,
        }
    }
}

impl DaemonConfig {
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(default_config_dir)
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.config_dir().join("agents")
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.config_dir().join("workflows")
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent-worker")
}

/// Ordered list of config file locations, lowest to highest priority.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from("/etc/agent-worker/config.yaml"));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".agent-worker/config.yaml"));
    }
    paths.push(PathBuf::from(".agent-worker.yaml"));
    paths
}

/// Load configuration by merging all discovered YAML files; `extra` is an
/// explicit path (`--config`) that overrides everything.
pub fn load_config(extra: Option<&Path>) -> anyhow::Result<DaemonConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        return Ok(DaemonConfig::default());
    }
    Ok(serde_yaml::from_value(merged).unwrap_or_default())
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
