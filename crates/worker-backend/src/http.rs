// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! In-process HTTP backend for OpenAI-compatible `/chat/completions` APIs.
//!
//! Unlike the subprocess variant, tool execution happens here: when the
//! model replies with tool calls, each one is dispatched through the
//! supplied [`ToolSet`], the results are appended as `tool` messages, and
//! the conversation is resubmitted — bounded by `max_steps` rounds so a
//! model stuck in a tool loop cannot spin forever.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{Backend, BackendResponse, SendOptions, TokenUsage, ToolCallRecord};

pub struct HttpBackend {
    model: String,
    chat_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpBackend {
    /// `base_url` ends before `/chat/completions`,
    /// e.g. `http://localhost:8000/v1`.
    pub fn new(model: String, base_url: &str, api_key: Option<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            model,
            chat_url: format!("{base}/chat/completions"),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn tool_schemas_json(opts: &SendOptions) -> Vec<Value> {
        opts.tool_set
            .as_ref()
            .map(|ts| {
                ts.schemas()
                    .into_iter()
                    .map(|s| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": s.name,
                                "description": s.description,
                                "parameters": s.parameters,
                            }
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn complete_once(
        &self,
        messages: &[Value],
        tools: &[Value],
        opts: &SendOptions,
    ) -> anyhow::Result<Value> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
        }

        let mut req = self
            .client
            .post(&self.chat_url)
            .timeout(opts.timeout())
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.context("chat completion request failed")?;
        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .context("chat completion response was not JSON")?;
        if !status.is_success() {
            anyhow::bail!("chat completion error {status}: {payload}");
        }
        Ok(payload)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, prompt: &str, opts: &SendOptions) -> anyhow::Result<BackendResponse> {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &opts.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let tools = Self::tool_schemas_json(opts);
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut saw_usage = false;

        for step in 0..opts.max_steps() {
            let payload = self.complete_once(&messages, &tools, opts).await?;

            if let Some(u) = payload.get("usage") {
                saw_usage = true;
                usage.input_tokens += u
                    .get("prompt_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                usage.output_tokens += u
                    .get("completion_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
            }

            let message = payload
                .pointer("/choices/0/message")
                .cloned()
                .context("chat completion response had no choices")?;
            let content = message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let tool_calls = message
                .get("tool_calls")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            if tool_calls.is_empty() {
                return Ok(BackendResponse {
                    content,
                    tool_calls: records,
                    usage: saw_usage.then_some(usage),
                });
            }

            let Some(tool_set) = &opts.tool_set else {
                // The model asked for tools we cannot execute; return what
                // text there is rather than looping.
                warn!("model emitted tool calls but no tool set was supplied");
                return Ok(BackendResponse {
                    content,
                    tool_calls: records,
                    usage: saw_usage.then_some(usage),
                });
            };

            messages.push(message.clone());
            for call in &tool_calls {
                let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
                let name = call
                    .pointer("/function/name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let args: Value = call
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or(Value::Object(Default::default()));

                debug!(step, tool = %name, "executing tool call");
                let (output, is_error) = match tool_set.invoke(&name, args.clone()).await {
                    Ok(value) => (value.to_string(), false),
                    Err(e) => (format!("tool error: {e}"), true),
                };
                records.push(ToolCallRecord {
                    name,
                    args,
                    output: Some(output.clone()),
                    is_error,
                });
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "content": output,
                }));
            }
        }

        // Step budget exhausted mid-tool-loop: surface what we have.
        Ok(BackendResponse {
            content: String::new(),
            tool_calls: records,
            usage: saw_usage.then_some(usage),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_url_appends_path() {
        let b = HttpBackend::new("m".into(), "http://localhost:8000/v1", None);
        assert_eq!(b.chat_url, "http://localhost:8000/v1/chat/completions");
    }

    #[test]
    fn base_url_trailing_slash_stripped() {
        let b = HttpBackend::new("m".into(), "http://localhost:8000/v1/", None);
        assert_eq!(b.chat_url, "http://localhost:8000/v1/chat/completions");
    }

    #[test]
    fn tool_schemas_empty_without_tool_set() {
        assert!(HttpBackend::tool_schemas_json(&SendOptions::default()).is_empty());
    }
}
