// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{parse_workflow_target, Cli, Commands};
use worker_daemon::{discovery, load_config, Daemon, DaemonConfig, WorkflowSpec};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Daemon { host, port, token } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if token.is_some() {
                config.token = token;
            }
            run_daemon(config).await
        }
        Commands::New {
            name,
            model,
            system,
            backend,
        } => {
            let client = Client::discover(&config)?;
            let mut body = serde_json::json!({ "name": name, "model": model });
            if let Some(system) = system {
                body["system"] = system.into();
            }
            if let Some(backend) = backend {
                body["backend"] = backend.into();
            }
            let reply = client.post("/agents", &body).await?;
            println!("created agent {}", reply["name"].as_str().unwrap_or(&name));
            Ok(())
        }
        Commands::Ls => {
            let client = Client::discover(&config)?;
            let reply = client.get("/agents").await?;
            let agents = reply["agents"].as_array().cloned().unwrap_or_default();
            if agents.is_empty() {
                println!("No agents.");
                return Ok(());
            }
            println!("{:<20}  {:<10}  {:<16}  WORKFLOW", "NAME", "STATE", "MODEL");
            println!("{}", "-".repeat(64));
            for a in agents {
                println!(
                    "{:<20}  {:<10}  {:<16}  {}",
                    a["name"].as_str().unwrap_or("-"),
                    a["state"].as_str().unwrap_or("-"),
                    a["model"].as_str().unwrap_or("-"),
                    a["workflow"].as_str().unwrap_or("-"),
                );
            }
            Ok(())
        }
        Commands::Status => {
            let client = Client::discover(&config)?;
            let reply = client.get("/health").await?;
            println!("pid:      {}", reply["pid"]);
            println!("port:     {}", reply["port"]);
            println!("uptime:   {}s", reply["uptime_secs"]);
            println!(
                "agents:   {}",
                join_strings(&reply["agents"]).unwrap_or_else(|| "-".into())
            );
            println!(
                "workflows: {}",
                join_strings(&reply["workflows"]).unwrap_or_else(|| "-".into())
            );
            Ok(())
        }
        Commands::Send { agent, message } => {
            let client = Client::discover(&config)?;
            let body = serde_json::json!({ "agent": agent, "message": message.join(" ") });
            let reply = client.post("/serve", &body).await?;
            if reply["success"].as_bool().unwrap_or(false) {
                println!("{}", reply["content"].as_str().unwrap_or(""));
                Ok(())
            } else {
                anyhow::bail!(
                    "agent turn failed: {}",
                    reply["error"].as_str().unwrap_or("unknown error")
                );
            }
        }
        Commands::Peek { agent } => {
            let client = Client::discover(&config)?;
            let reply = client.get(&format!("/agents/{agent}")).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
            Ok(())
        }
        Commands::Run { file } => {
            let client = Client::discover(&config)?;
            let spec = read_workflow(&file)?;
            let key = spec.key();
            let mut body = serde_json::to_value(&spec)?;
            body["mode"] = "run".into();
            client.post("/workflows", &body).await?;
            println!("workflow {key} running; waiting for completion (Ctrl-C to detach)");

            // Poll until the daemon tears the workflow down.
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("interrupted");
                        std::process::exit(130);
                    }
                    _ = tokio::time::sleep(Duration::from_millis(1000)) => {}
                }
                let reply = client.get("/workflows").await?;
                let still_running = reply["workflows"]
                    .as_array()
                    .map(|ws| {
                        ws.iter().any(|w| {
                            w["name"] == spec.name.as_str() && w["tag"] == spec.tag.as_str()
                        })
                    })
                    .unwrap_or(false);
                if !still_running {
                    println!("workflow {key} complete");
                    return Ok(());
                }
            }
        }
        Commands::Start { file } => {
            let client = Client::discover(&config)?;
            let spec = read_workflow(&file)?;
            let key = spec.key();
            let mut body = serde_json::to_value(&spec)?;
            body["mode"] = "start".into();
            client.post("/workflows", &body).await?;
            println!("workflow {key} started");
            Ok(())
        }
        Commands::Stop { target } => {
            let client = Client::discover(&config)?;
            match target {
                Some(target) => {
                    let (name, tag) = parse_workflow_target(&target)
                        .context("expected a workflow target like @name or @name:tag")?;
                    client.delete(&format!("/workflows/{name}/{tag}")).await?;
                    println!("workflow {name}:{tag} stopped");
                }
                None => {
                    client.post("/shutdown", &serde_json::json!({})).await?;
                    println!("daemon stopping");
                }
            }
            Ok(())
        }
    }
}

async fn run_daemon(config: DaemonConfig) -> anyhow::Result<()> {
    // Refuse to start over a live daemon; clean up after a dead one.
    if let Some(info) = discovery::load(&config.config_dir()) {
        anyhow::bail!(
            "a daemon is already running (pid {}, {})",
            info.pid,
            info.base_url()
        );
    }

    let daemon = Daemon::new(config);
    {
        // Ctrl-C triggers the same graceful path as POST /shutdown.
        let daemon = std::sync::Arc::clone(&daemon);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                daemon.request_shutdown();
            }
        });
    }
    worker_daemon::http::serve(daemon).await
}

fn read_workflow(path: &std::path::Path) -> anyhow::Result<WorkflowSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow file {}", path.display()))?;
    WorkflowSpec::parse(&text)
}

fn join_strings(value: &serde_json::Value) -> Option<String> {
    let items = value.as_array()?;
    if items.is_empty() {
        return None;
    }
    Some(
        items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    )
}

// ── HTTP client against the discovered daemon ─────────────────────────────────

struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    /// Resolve the daemon via the discovery file.
    fn discover(config: &DaemonConfig) -> anyhow::Result<Self> {
        let info = discovery::load(&config.config_dir())
            .context("no running daemon found (start one with `agent-worker daemon`)")?;
        Ok(Self {
            base_url: info.base_url(),
            token: info.token,
            http: reqwest::Client::new(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let resp = self.request(reqwest::Method::GET, path).send().await?;
        Self::read_json(resp).await
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let resp = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await?;
        Self::read_json(resp).await
    }

    async fn delete(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let resp = self.request(reqwest::Method::DELETE, path).send().await?;
        Self::read_json(resp).await
    }

    async fn read_json(resp: reqwest::Response) -> anyhow::Result<serde_json::Value> {
        let status = resp.status();
        let value: serde_json::Value = resp
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({ "error": "non-JSON response" }));
        if !status.is_success() {
            anyhow::bail!(
                "daemon returned {status}: {}",
                value["error"].as_str().unwrap_or("unknown error")
            );
        }
        Ok(value)
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
