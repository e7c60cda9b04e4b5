// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use worker_context::ContextProvider;

/// Per-call context handed to every tool: who is calling, and the shared
/// context they operate on.
#[derive(Clone)]
pub struct ToolCtx {
    pub caller: String,
    pub provider: Arc<ContextProvider>,
}

impl ToolCtx {
    /// The workflow's registered agent names.
    pub fn agents(&self) -> &[String] {
        self.provider.agents()
    }
}

/// Trait every collaboration tool implements.
///
/// Tools return domain errors as `Err`; the registry converts them into
/// protocol-level error results so a failing tool never kills a session.
#[async_trait]
pub trait CollabTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the arguments object.
    fn schema(&self) -> Value;
    async fn call(&self, ctx: &ToolCtx, args: Value) -> anyhow::Result<Value>;
}

/// Argument helpers shared by the tool implementations.
pub(crate) fn required_str(args: &Value, key: &str) -> anyhow::Result<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("missing required argument '{key}'"))
}

pub(crate) fn optional_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn optional_u64(args: &Value, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_u64)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn required_str_present_and_missing() {
        let args = json!({"message": "hi"});
        assert_eq!(required_str(&args, "message").unwrap(), "hi");
        assert!(required_str(&args, "other").is_err());
    }

    #[test]
    fn optional_helpers() {
        let args = json!({"to": "bob", "limit": 5});
        assert_eq!(optional_str(&args, "to").as_deref(), Some("bob"));
        assert_eq!(optional_str(&args, "nope"), None);
        assert_eq!(optional_u64(&args, "limit"), Some(5));
        assert_eq!(optional_u64(&args, "to"), None);
    }
}
