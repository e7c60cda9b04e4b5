// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{Backend, BackendResponse, SendOptions};

/// Deterministic mock backend for tests. Echoes the prompt back.
#[derive(Default)]
pub struct MockBackend;

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, prompt: &str, _opts: &SendOptions) -> anyhow::Result<BackendResponse> {
        Ok(BackendResponse::text(format!("MOCK: {prompt}")))
    }
}

/// One scripted step: either a canned response or a canned failure.
pub enum Step {
    Reply(BackendResponse),
    Fail(String),
}

/// A pre-scripted backend. Each `send` pops the next step from the front of
/// the queue — this lets tests specify exact reply sequences, including
/// failures, without network access. Prompts are recorded so tests can
/// inspect what the loop actually sent.
pub struct ScriptedBackend {
    steps: Mutex<Vec<Step>>,
    calls: AtomicUsize,
    /// What an exhausted script returns; `None` makes further calls fail.
    fallback: Option<String>,
    /// Every prompt seen, in call order.
    pub prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps),
            calls: AtomicUsize::new(0),
            fallback: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: backend that always returns the same text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        // An empty script falls back to the same reply, so "always" holds
        // no matter how many calls arrive.
        let mut s = Self::new(vec![]);
        s.fallback = Some(reply);
        s
    }

    /// Convenience: ordered text replies, one per call.
    pub fn text_sequence<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            replies
                .into_iter()
                .map(|r| Step::Reply(BackendResponse::text(r)))
                .collect(),
        )
    }

    /// Convenience: fail `n` times, then reply with `text` forever.
    pub fn fail_times(n: usize, text: impl Into<String>) -> Self {
        let mut steps: Vec<Step> = (0..n)
            .map(|i| Step::Fail(format!("scripted failure {}", i + 1)))
            .collect();
        steps.push(Step::Reply(BackendResponse::text(text)));
        let mut s = Self::new(steps);
        s.fallback = Some("[script exhausted]".to_string());
        s
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn send(&self, prompt: &str, _opts: &SendOptions) -> anyhow::Result<BackendResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());

        let step = {
            let mut steps = self.steps.lock().unwrap();
            if steps.is_empty() {
                None
            } else {
                Some(steps.remove(0))
            }
        };
        match step {
            Some(Step::Reply(resp)) => Ok(resp),
            Some(Step::Fail(msg)) => anyhow::bail!(msg),
            None => match &self.fallback {
                Some(text) => Ok(BackendResponse::text(text.clone())),
                None => anyhow::bail!("scripted backend: no more steps"),
            },
        }
    }
}

/// Backend whose every call fails. Exercises the retry/ack paths.
#[derive(Default)]
pub struct FailingBackend {
    calls: AtomicUsize,
}

impl FailingBackend {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FailingBackend {
    fn name(&self) -> &str {
        "failing-mock"
    }

    async fn send(&self, _prompt: &str, _opts: &SendOptions) -> anyhow::Result<BackendResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        anyhow::bail!("backend failure (call {n})")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_echoes_prompt() {
        let b = MockBackend;
        let resp = b.send("hi", &SendOptions::default()).await.unwrap();
        assert_eq!(resp.content, "MOCK: hi");
    }

    #[tokio::test]
    async fn scripted_pops_in_order() {
        let b = ScriptedBackend::text_sequence(["one", "two"]);
        assert_eq!(b.send("a", &SendOptions::default()).await.unwrap().content, "one");
        assert_eq!(b.send("b", &SendOptions::default()).await.unwrap().content, "two");
        assert!(b.send("c", &SendOptions::default()).await.is_err());
        assert_eq!(b.call_count(), 3);
    }

    #[tokio::test]
    async fn scripted_records_prompts() {
        let b = ScriptedBackend::text_sequence(["ok"]);
        b.send("the prompt", &SendOptions::default()).await.unwrap();
        assert_eq!(b.prompts.lock().unwrap()[0], "the prompt");
    }

    #[tokio::test]
    async fn fail_times_then_succeeds() {
        let b = ScriptedBackend::fail_times(2, "finally");
        assert!(b.send("x", &SendOptions::default()).await.is_err());
        assert!(b.send("x", &SendOptions::default()).await.is_err());
        assert_eq!(b.send("x", &SendOptions::default()).await.unwrap().content, "finally");
    }

    #[tokio::test]
    async fn always_text_never_runs_out() {
        let b = ScriptedBackend::always_text("ok");
        for _ in 0..5 {
            assert_eq!(b.send("x", &SendOptions::default()).await.unwrap().content, "ok");
        }
    }

    #[tokio::test]
    async fn failing_backend_counts_calls() {
        let b = FailingBackend::default();
        assert!(b.send("x", &SendOptions::default()).await.is_err());
        assert!(b.send("x", &SendOptions::default()).await.is_err());
        assert_eq!(b.call_count(), 2);
    }
}
