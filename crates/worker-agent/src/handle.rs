// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Agent definitions, runtime handles, and the registry.
//!
//! The handle is the identity root for one agent: it owns the definition,
//! the persistent context directory (`memory/`, `notes/`, `todo/`,
//! `conversations/`), the conversation log + thin thread, and the mutable
//! loop slot. Registry entries are replaced wholesale on re-registration
//! (reload semantics); ephemeral handles create no disk artifacts at all.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use worker_backend::{BackendConfig, BackendKind};

use crate::conversation::{ConversationLog, ThinThread, THIN_THREAD_LEN};
use crate::loop_core::AgentLoop;

/// Per-agent knobs for prompt context assembly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Free-text project description injected into every prompt.
    pub project: Option<String>,
    /// Entry-point document path; defaults to `notes.md`.
    pub document_path: Option<String>,
    /// Thin-thread capacity override.
    pub thin_thread_len: Option<usize>,
}

/// One agent as configured on disk (`agents/<name>.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefinition {
    pub name: String,
    pub model: String,
    pub backend: BackendKind,
    /// Variant-specific backend settings; `backend` + `model` are used when
    /// absent.
    pub provider_config: Option<BackendConfig>,
    #[serde(alias = "system")]
    pub system_prompt: Option<String>,
    /// Cron-style schedule hint; honored by external schedulers, carried
    /// here so definitions round-trip.
    pub schedule: Option<String>,
    pub max_tokens: Option<u32>,
    pub max_steps: Option<u32>,
    pub context_config: Option<ContextConfig>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// The effective backend configuration: the explicit `provider_config`
    /// when present, otherwise `backend` + `model` with defaults.
    pub fn backend_config(&self) -> BackendConfig {
        match &self.provider_config {
            Some(cfg) => {
                let mut cfg = cfg.clone();
                if cfg.model.is_empty() {
                    cfg.model = self.model.clone();
                }
                cfg
            }
            None => BackendConfig {
                kind: self.backend,
                model: self.model.clone(),
                ..Default::default()
            },
        }
    }

    pub fn document_path(&self) -> String {
        self.context_config
            .as_ref()
            .and_then(|c| c.document_path.clone())
            .unwrap_or_else(|| worker_context::DEFAULT_DOCUMENT.to_string())
    }

    pub fn thin_thread_len(&self) -> usize {
        self.context_config
            .as_ref()
            .and_then(|c| c.thin_thread_len)
            .unwrap_or(THIN_THREAD_LEN)
    }
}

/// Runtime wrapper around a definition. See the module docs.
pub struct AgentHandle {
    pub definition: AgentDefinition,
    /// Persistent context dir; `None` for ephemeral handles.
    dir: Option<PathBuf>,
    pub ephemeral: bool,
    conversation: Option<ConversationLog>,
    thin_thread: Arc<Mutex<ThinThread>>,
    /// The loop slot — populated lazily, replaced on workflow restart.
    agent_loop: StdMutex<Option<Arc<AgentLoop>>>,
}

impl AgentHandle {
    /// A handle with no disk artifacts, outside any registry. Workflow
    /// agents are built this way — their lifetime is the workflow's.
    pub fn ephemeral(definition: AgentDefinition) -> Arc<Self> {
        Arc::new(Self::new(definition, None))
    }

    fn new(definition: AgentDefinition, dir: Option<PathBuf>) -> Self {
        let ephemeral = dir.is_none();
        let conversation = dir
            .as_ref()
            .map(|d| ConversationLog::new(d.join("conversations/personal.jsonl")));
        let thin_thread = Arc::new(Mutex::new(ThinThread::new(definition.thin_thread_len())));
        Self {
            definition,
            dir,
            ephemeral,
            conversation,
            thin_thread,
            agent_loop: StdMutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn conversation(&self) -> Option<&ConversationLog> {
        self.conversation.as_ref()
    }

    pub fn thin_thread(&self) -> Arc<Mutex<ThinThread>> {
        Arc::clone(&self.thin_thread)
    }

    pub fn todo_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join("todo/index.md"))
    }

    // ── Loop slot ─────────────────────────────────────────────────────────────

    pub fn set_loop(&self, agent_loop: Arc<AgentLoop>) {
        *self.agent_loop.lock().unwrap() = Some(agent_loop);
    }

    pub fn take_loop(&self) -> Option<Arc<AgentLoop>> {
        self.agent_loop.lock().unwrap().take()
    }

    pub fn agent_loop(&self) -> Option<Arc<AgentLoop>> {
        self.agent_loop.lock().unwrap().clone()
    }

    /// The state reported on the HTTP surface: the loop's state when a loop
    /// exists (`error` when its last run failed), `idle` otherwise.
    pub fn state_name(&self) -> &'static str {
        match self.agent_loop() {
            Some(l) => {
                if l.state() == crate::loop_core::LoopState::Idle && l.has_failures() {
                    "error"
                } else {
                    l.state().as_str()
                }
            }
            None => "idle",
        }
    }

    // ── Persistent artifacts ──────────────────────────────────────────────────

    /// Write a dated note under `notes/`.
    pub async fn write_note(&self, slug: &str, text: &str) -> anyhow::Result<PathBuf> {
        let dir = self
            .dir
            .as_ref()
            .context("ephemeral agent has no notes directory")?;
        let date = Local::now().format("%Y-%m-%d");
        let path = dir.join(format!("notes/{date}-{slug}.md"));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, text).await?;
        Ok(path)
    }

    /// Read one memory entry (`memory/<key>.yaml`) as a YAML value.
    pub async fn memory_get(&self, key: &str) -> anyhow::Result<Option<serde_yaml::Value>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let path = dir.join(format!("memory/{key}.yaml"));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(serde_yaml::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write one memory entry.
    pub async fn memory_set(&self, key: &str, value: &serde_yaml::Value) -> anyhow::Result<()> {
        let dir = self
            .dir
            .as_ref()
            .context("ephemeral agent has no memory directory")?;
        let path = dir.join(format!("memory/{key}.yaml"));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_yaml::to_string(value)?).await?;
        Ok(())
    }
}

/// Count open items (`- [ ]` lines) in a todo index file.
pub async fn count_open_todos(path: &Path) -> usize {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => text
            .lines()
            .filter(|l| l.trim_start().starts_with("- [ ]"))
            .count(),
        Err(_) => 0,
    }
}

const CONTEXT_SUBDIRS: &[&str] = &["memory", "notes", "todo", "conversations"];

/// Keyed map `name → handle` plus the on-disk definition layout.
pub struct AgentRegistry {
    /// Root for definitions (`<root>/<name>.yaml`) and context dirs
    /// (`<root>/<name>/`).
    root: PathBuf,
    handles: StdMutex<HashMap<String, Arc<AgentHandle>>>,
}

impl AgentRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: StdMutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn definition_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.yaml"))
    }

    fn context_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Register (or re-register) a persistent agent: ensures the context
    /// dir subtree exists and replaces any prior handle of the same name.
    pub async fn register_definition(
        &self,
        definition: AgentDefinition,
    ) -> anyhow::Result<Arc<AgentHandle>> {
        anyhow::ensure!(!definition.name.is_empty(), "agent name must not be empty");
        let dir = self.context_dir(&definition.name);
        for sub in CONTEXT_SUBDIRS {
            tokio::fs::create_dir_all(dir.join(sub))
                .await
                .with_context(|| format!("creating context dir for {}", definition.name))?;
        }
        let handle = Arc::new(AgentHandle::new(definition, Some(dir)));
        let name = handle.name().to_string();
        let prior = self
            .handles
            .lock()
            .unwrap()
            .insert(name.clone(), Arc::clone(&handle));
        if prior.is_some() {
            debug!(agent = %name, "replaced existing handle (reload)");
        }
        info!(agent = %name, "agent registered");
        Ok(handle)
    }

    /// Register an agent with no disk artifacts.
    pub fn register_ephemeral(&self, definition: AgentDefinition) -> Arc<AgentHandle> {
        let handle = Arc::new(AgentHandle::new(definition, None));
        self.handles
            .lock()
            .unwrap()
            .insert(handle.name().to_string(), Arc::clone(&handle));
        info!(agent = %handle.name(), "ephemeral agent registered");
        handle
    }

    /// Create a brand-new agent: writes the YAML definition, then
    /// registers. Fails when the definition file already exists.
    pub async fn create(&self, definition: AgentDefinition) -> anyhow::Result<Arc<AgentHandle>> {
        let path = self.definition_path(&definition.name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            anyhow::bail!("agent {:?} already exists", definition.name);
        }
        tokio::fs::create_dir_all(&self.root).await?;
        let yaml = serde_yaml::to_string(&definition)?;
        tokio::fs::write(&path, yaml)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        self.register_definition(definition).await
    }

    /// Best-effort removal: definition file, context dir, registry entry.
    /// The caller is responsible for stopping the loop first.
    pub async fn delete(&self, name: &str) -> Option<Arc<AgentHandle>> {
        let handle = self.handles.lock().unwrap().remove(name);
        if let Err(e) = tokio::fs::remove_file(self.definition_path(name)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(agent = %name, error = %e, "could not remove definition file");
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(self.context_dir(name)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(agent = %name, error = %e, "could not remove context dir");
            }
        }
        info!(agent = %name, "agent deleted");
        handle
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentHandle>> {
        self.handles.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn handles(&self) -> Vec<Arc<AgentHandle>> {
        self.handles.lock().unwrap().values().cloned().collect()
    }

    /// Load every `*.yaml` definition under the registry root. Invalid
    /// files are skipped with a warning so one bad definition cannot keep
    /// the daemon from starting.
    pub async fn load_from_disk(&self) -> anyhow::Result<usize> {
        let mut loaded = 0;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await?;
            match serde_yaml::from_str::<AgentDefinition>(&text) {
                Ok(def) if !def.name.is_empty() => {
                    self.register_definition(def).await?;
                    loaded += 1;
                }
                Ok(_) => warn!(path = %path.display(), "skipping definition without a name"),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid definition"),
            }
        }
        Ok(loaded)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, AgentRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = AgentRegistry::new(dir.path().join("agents"));
        (dir, reg)
    }

    #[tokio::test]
    async fn register_creates_context_subtree() {
        let (_tmp, reg) = registry();
        let handle = reg
            .register_definition(AgentDefinition::new("alice", "test-model"))
            .await
            .unwrap();
        let dir = handle.dir().unwrap();
        for sub in ["memory", "notes", "todo", "conversations"] {
            assert!(dir.join(sub).is_dir(), "missing {sub}/");
        }
    }

    #[tokio::test]
    async fn reregistration_replaces_the_handle() {
        let (_tmp, reg) = registry();
        let first = reg
            .register_definition(AgentDefinition::new("alice", "m1"))
            .await
            .unwrap();
        let second = reg
            .register_definition(AgentDefinition::new("alice", "m2"))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(reg.get("alice").unwrap().definition.model, "m2");
        assert_eq!(reg.names().len(), 1);
    }

    #[tokio::test]
    async fn ephemeral_handles_have_no_disk_artifacts() {
        let (tmp, reg) = registry();
        let handle = reg.register_ephemeral(AgentDefinition::new("ghost", "m"));
        assert!(handle.ephemeral);
        assert!(handle.dir().is_none());
        assert!(handle.conversation().is_none());
        assert!(!tmp.path().join("agents/ghost").exists());
    }

    #[tokio::test]
    async fn create_writes_yaml_and_rejects_duplicates() {
        let (_tmp, reg) = registry();
        reg.create(AgentDefinition::new("alice", "m")).await.unwrap();
        assert!(reg.root().join("alice.yaml").is_file());

        let err = reg.create(AgentDefinition::new("alice", "m")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn delete_removes_yaml_dir_and_entry() {
        let (_tmp, reg) = registry();
        reg.create(AgentDefinition::new("alice", "m")).await.unwrap();
        reg.delete("alice").await;
        assert!(reg.get("alice").is_none());
        assert!(!reg.root().join("alice.yaml").exists());
        assert!(!reg.root().join("alice").exists());
        // Deleting again is harmless.
        reg.delete("alice").await;
    }

    #[tokio::test]
    async fn load_from_disk_restores_definitions() {
        let (_tmp, reg) = registry();
        reg.create(AgentDefinition::new("alice", "m")).await.unwrap();
        reg.create(AgentDefinition::new("bob", "m")).await.unwrap();

        let reg2 = AgentRegistry::new(reg.root());
        let loaded = reg2.load_from_disk().await.unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(reg2.names(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn load_from_disk_skips_invalid_files() {
        let (_tmp, reg) = registry();
        tokio::fs::create_dir_all(reg.root()).await.unwrap();
        tokio::fs::write(reg.root().join("bad.yaml"), ": not valid : [")
            .await
            .unwrap();
        assert_eq!(reg.load_from_disk().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn todo_counting_matches_open_checkboxes() {
        let (_tmp, reg) = registry();
        let handle = reg
            .register_definition(AgentDefinition::new("alice", "m"))
            .await
            .unwrap();
        let todo = handle.todo_path().unwrap();
        tokio::fs::write(
            &todo,
            "# Todo\n- [ ] first\n- [x] done\n- [ ] second\nnot a task\n",
        )
        .await
        .unwrap();
        assert_eq!(count_open_todos(&todo).await, 2);
        assert_eq!(count_open_todos(Path::new("/nope/none.md")).await, 0);
    }

    #[tokio::test]
    async fn notes_and_memory_round_trip() {
        let (_tmp, reg) = registry();
        let handle = reg
            .register_definition(AgentDefinition::new("alice", "m"))
            .await
            .unwrap();

        let path = handle.write_note("standup", "did things").await.unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with("-standup.md"));

        let value: serde_yaml::Value = serde_yaml::from_str("favorite: rust").unwrap();
        handle.memory_set("prefs", &value).await.unwrap();
        let back = handle.memory_get("prefs").await.unwrap().unwrap();
        assert_eq!(back["favorite"], serde_yaml::Value::from("rust"));
        assert!(handle.memory_get("missing").await.unwrap().is_none());
    }

    #[test]
    fn definition_yaml_round_trip_with_system_alias() {
        let yaml = "name: alice\nmodel: test\nsystem: be helpful\n";
        let def: AgentDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.system_prompt.as_deref(), Some("be helpful"));
        assert_eq!(def.backend, BackendKind::Mock);
    }

    #[test]
    fn backend_config_falls_back_to_kind_and_model() {
        let mut def = AgentDefinition::new("alice", "gpt-test");
        def.backend = BackendKind::Http;
        let cfg = def.backend_config();
        assert_eq!(cfg.kind, BackendKind::Http);
        assert_eq!(cfg.model, "gpt-test");
    }

    #[test]
    fn state_name_without_loop_is_idle() {
        let handle = AgentHandle::new(AgentDefinition::new("alice", "m"), None);
        assert_eq!(handle.state_name(), "idle");
    }
}
