// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Subprocess backend: wraps an external CLI agent.
//!
//! The prompt is written to the child's stdin; the system prompt, the
//! collaboration tool endpoint URL and a tool-manifest file path are
//! exported through the environment. The child is expected to talk to the
//! tool endpoint directly over HTTP — this backend never executes tools
//! itself.
//!
//! # Stdout wire format
//!
//! One JSON event per line:
//! ```text
//! {"type":"text","text":"..."}            streamed output fragment
//! {"type":"tool_call","name":"...","args":{...}}
//! {"type":"result","text":"..."}          authoritative final text
//! ```
//! Unknown event types are ignored for forward compatibility; lines that
//! fail to parse as JSON are treated as raw output.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{Backend, BackendResponse, SendOptions, ToolCallRecord};

/// Environment variables exported to the child.
pub const ENV_MCP_URL: &str = "AGENT_WORKER_MCP_URL";
pub const ENV_SYSTEM_PROMPT: &str = "AGENT_WORKER_SYSTEM_PROMPT";
pub const ENV_TOOL_MANIFEST: &str = "AGENT_WORKER_TOOL_MANIFEST";

pub struct SubprocessBackend {
    command: Vec<String>,
    timeout: Duration,
    /// The in-flight child, kept so `abort` can kill it.
    child: Mutex<Option<Child>>,
}

impl SubprocessBackend {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            child: Mutex::new(None),
        }
    }

    /// Write the tool manifest (names + schemas) to a temp file and return
    /// its path, or `None` when the call carries no tools.
    async fn write_manifest(&self, opts: &SendOptions) -> anyhow::Result<Option<std::path::PathBuf>> {
        let Some(tool_set) = &opts.tool_set else {
            return Ok(None);
        };
        let manifest = serde_json::to_string_pretty(&tool_set.schemas())?;
        let path = std::env::temp_dir().join(format!(
            "agent-worker-tools-{}.json",
            uuid::Uuid::new_v4()
        ));
        tokio::fs::write(&path, manifest).await?;
        Ok(Some(path))
    }
}

#[async_trait]
impl Backend for SubprocessBackend {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn send(&self, prompt: &str, opts: &SendOptions) -> anyhow::Result<BackendResponse> {
        let (argv0, rest) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("subprocess backend has an empty command"))?;

        let manifest_path = self.write_manifest(opts).await?;

        let mut cmd = Command::new(argv0);
        cmd.args(rest)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(url) = &opts.mcp_url {
            cmd.env(ENV_MCP_URL, url);
        }
        if let Some(system) = &opts.system {
            cmd.env(ENV_SYSTEM_PROMPT, system);
        }
        if let Some(path) = &manifest_path {
            cmd.env(ENV_TOOL_MANIFEST, path);
        }

        debug!(command = %argv0, "spawning subprocess backend");
        let mut child = cmd.spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("subprocess stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("subprocess stdout unavailable"))?;

        // Park the child so abort() can reach it while we stream stdout.
        *self.child.lock().await = Some(child);

        let prompt = prompt.to_string();
        let writer = tokio::spawn(async move {
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });

        let parse = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut text = String::new();
            let mut raw = String::new();
            let mut final_text: Option<String> = None;
            let mut tool_calls = Vec::new();

            while let Some(line) = lines.next_line().await? {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(event) => match event.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(t) = event.get("text").and_then(Value::as_str) {
                                text.push_str(t);
                            }
                        }
                        Some("tool_call") => {
                            let name = event
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            if name.is_empty() {
                                warn!("subprocess emitted tool_call without a name; dropped");
                                continue;
                            }
                            tool_calls.push(ToolCallRecord {
                                name,
                                args: event.get("args").cloned().unwrap_or(Value::Null),
                                output: event
                                    .get("output")
                                    .and_then(Value::as_str)
                                    .map(str::to_string),
                                is_error: event
                                    .get("is_error")
                                    .and_then(Value::as_bool)
                                    .unwrap_or(false),
                            });
                        }
                        Some("result") => {
                            final_text = event
                                .get("text")
                                .and_then(Value::as_str)
                                .map(str::to_string);
                        }
                        _ => {} // unknown event types are ignored
                    },
                    Err(_) => {
                        raw.push_str(trimmed);
                        raw.push('\n');
                    }
                }
            }

            let content = final_text.unwrap_or_else(|| {
                if !text.is_empty() {
                    text
                } else {
                    raw.trim_end().to_string()
                }
            });
            anyhow::Ok(BackendResponse {
                content,
                tool_calls,
                usage: None,
            })
        };

        let timeout = opts.timeout.unwrap_or(self.timeout);
        let result = tokio::time::timeout(timeout, parse).await;

        // Reap (or kill) the child before joining the writer: a child that
        // never read its stdin would otherwise leave the writer blocked on
        // a full pipe.
        let mut guard = self.child.lock().await;
        let status = match guard.take() {
            Some(mut child) => match result {
                Ok(_) => child.wait().await.ok(),
                Err(_) => {
                    let _ = child.kill().await;
                    None
                }
            },
            None => None, // aborted concurrently
        };
        drop(guard);
        let _ = writer.await;

        if let Some(path) = manifest_path {
            let _ = tokio::fs::remove_file(path).await;
        }

        match result {
            Ok(resp) => {
                let resp = resp?;
                if let Some(status) = status {
                    if !status.success() {
                        anyhow::bail!(
                            "subprocess backend exited with {} — output: {}",
                            status,
                            truncate(&resp.content, 200)
                        );
                    }
                }
                Ok(resp)
            }
            Err(_) => anyhow::bail!("subprocess backend timed out after {}s", timeout.as_secs()),
        }
    }

    async fn abort(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i < limit)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &s[..cut])
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
