// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Backend adapters: everything the daemon needs from an LLM is
//! `send(prompt, opts) → response` plus an optional `abort()`.
//!
//! Three variants behind the one [`Backend`] trait:
//! - [`MockBackend`] / [`ScriptedBackend`] / [`FailingBackend`] —
//!   deterministic test doubles, no network.
//! - [`SubprocessBackend`] — wraps a CLI agent; the prompt goes to stdin,
//!   stdout is stream-parsed for text and tool-call records, and the child
//!   talks to the collaboration tool endpoint directly over HTTP.
//! - [`HttpBackend`] — in-process adapter for OpenAI-compatible
//!   `/chat/completions` APIs, driving a bounded tool loop through the
//!   supplied [`ToolSet`].
//!
//! Tool execution is the only place the variants differ structurally: the
//! in-process variant invokes handlers through [`ToolSet`] during step
//! iteration, while the subprocess variant only needs the endpoint URL and
//! a manifest of tool names.

mod http;
mod mock;
mod subprocess;

pub use http::HttpBackend;
pub use mock::{FailingBackend, MockBackend, ScriptedBackend, Step};
pub use subprocess::SubprocessBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default cap on tool-execution rounds for in-process backends.
pub const DEFAULT_MAX_STEPS: u32 = 10;

/// Default per-call timeout. Generous because CLI subprocess variants may
/// spend minutes inside their own tool loops.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// JSON-schema description of one callable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The seam between a backend and the collaboration tool server.
///
/// The in-process variant calls `invoke` during its step loop; errors come
/// back as values (fed to the model as the tool result), never as transport
/// failures.
#[async_trait]
pub trait ToolSet: Send + Sync {
    fn schemas(&self) -> Vec<ToolSchema>;
    async fn invoke(&self, name: &str, args: Value) -> anyhow::Result<Value>;
}

/// One tool invocation observed during a backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct SendOptions {
    /// System prompt; `None` lets the backend use its own default.
    pub system: Option<String>,
    /// Executable tool handlers for in-process backends.
    pub tool_set: Option<Arc<dyn ToolSet>>,
    /// Collaboration tool endpoint URL, exported to subprocess backends.
    pub mcp_url: Option<String>,
    /// Cap on tool rounds; `None` uses [`DEFAULT_MAX_STEPS`].
    pub max_steps: Option<u32>,
    /// Per-call deadline; `None` uses [`DEFAULT_TIMEOUT`].
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn max_steps(&self) -> u32 {
        self.max_steps.unwrap_or(DEFAULT_MAX_STEPS)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackendResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Option<TokenUsage>,
}

impl BackendResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Adapter to an LLM. See the module docs for the variants.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable backend name for status display.
    fn name(&self) -> &str;

    async fn send(&self, prompt: &str, opts: &SendOptions) -> anyhow::Result<BackendResponse>;

    /// Best-effort cancellation of an in-flight call. The default is a
    /// no-op; the call then simply runs to completion.
    async fn abort(&self) {}
}

// ── Configuration-driven construction ─────────────────────────────────────────

/// Which backend variant an agent definition selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Mock,
    Subprocess,
    Http,
}

/// Backend selection plus the per-variant knobs, as found in an agent
/// definition's `provider` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub model: String,
    /// `http`: API base ending before `/chat/completions`.
    pub base_url: Option<String>,
    /// `http`: environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// `subprocess`: argv of the CLI to spawn.
    pub command: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// Build a backend from its configuration.
pub fn from_config(cfg: &BackendConfig) -> anyhow::Result<Arc<dyn Backend>> {
    let timeout = cfg
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT);
    match cfg.kind {
        BackendKind::Mock => Ok(Arc::new(MockBackend::default())),
        BackendKind::Subprocess => {
            if cfg.command.is_empty() {
                anyhow::bail!("subprocess backend requires a non-empty command");
            }
            Ok(Arc::new(SubprocessBackend::new(cfg.command.clone(), timeout)))
        }
        BackendKind::Http => {
            let base_url = cfg
                .base_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("http backend requires base_url"))?;
            let api_key = cfg
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            Ok(Arc::new(HttpBackend::new(
                cfg.model.clone(),
                &base_url,
                api_key,
            )))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
