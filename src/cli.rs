// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "agent-worker",
    about = "Multi-agent orchestration daemon",
    version
)]
pub struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Explicit config file (overrides the layered defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon in the foreground
    Daemon {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Require this bearer token on every request
        #[arg(long, env = "AGENT_WORKER_TOKEN")]
        token: Option<String>,
    },

    /// Create a new standalone agent
    New {
        name: String,
        /// Model identifier
        #[arg(long, default_value = "mock-model")]
        model: String,
        /// System prompt
        #[arg(long)]
        system: Option<String>,
        /// Backend variant: mock, subprocess, http
        #[arg(long)]
        backend: Option<String>,
    },

    /// List agents and their states
    Ls,

    /// Show daemon health
    Status,

    /// Send a message to an agent and print its reply
    Send {
        agent: String,
        /// Message text (joined with spaces)
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },

    /// Show one agent's details
    Peek { agent: String },

    /// Run a workflow file to completion, then tear it down
    Run { file: PathBuf },

    /// Start a workflow file and leave it running
    Start { file: PathBuf },

    /// Stop the daemon, or a workflow with `stop @name[:tag]`
    Stop {
        /// `@name` or `@name:tag` of a workflow; omitted = whole daemon
        target: Option<String>,
    },
}

/// Parse a `@name[:tag]` workflow target into `(name, tag)`.
pub fn parse_workflow_target(target: &str) -> Option<(String, String)> {
    let stripped = target.strip_prefix('@')?;
    if stripped.is_empty() {
        return None;
    }
    match stripped.split_once(':') {
        Some((name, tag)) if !name.is_empty() && !tag.is_empty() => {
            Some((name.to_string(), tag.to_string()))
        }
        Some(_) => None,
        None => Some((stripped.to_string(), "main".to_string())),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_target_with_tag() {
        assert_eq!(
            parse_workflow_target("@review:pr-1"),
            Some(("review".into(), "pr-1".into()))
        );
    }

    #[test]
    fn workflow_target_defaults_to_main_tag() {
        assert_eq!(
            parse_workflow_target("@review"),
            Some(("review".into(), "main".into()))
        );
    }

    #[test]
    fn invalid_targets_are_rejected() {
        assert_eq!(parse_workflow_target("review"), None);
        assert_eq!(parse_workflow_target("@"), None);
        assert_eq!(parse_workflow_target("@name:"), None);
    }

    #[test]
    fn cli_parses_send_with_multiword_message() {
        let cli = Cli::parse_from(["agent-worker", "send", "alice", "hello", "there"]);
        match cli.command {
            Commands::Send { agent, message } => {
                assert_eq!(agent, "alice");
                assert_eq!(message.join(" "), "hello there");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
