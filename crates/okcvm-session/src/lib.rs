//! Multi-tenant session state and session store (spec components E+F).
//!
//! Generalises `aigent-runtime::server::DaemonState` — a single process-wide
//! `Mutex<DaemonState>` composing `AgentRuntime` + `MemoryManager` +
//! `ToolRegistry` + `ToolExecutor` behind one connection handler — into a
//! facade constructed once per client instead of once per process. The
//! teacher has no multi-tenant map at all (its daemon serves exactly one
//! Unix-socket connection's worth of state); `SessionStore`'s
//! `DashMap<ClientId, Arc<SessionState>>` with per-key lazy construction is
//! new ambient surface, shaped the way the wider pack's
//! `querymt-agent::SessionRegistry` keys a plain data structure by client
//! rather than reaching for an actor system.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use okcvm_config::ConfigHandle;
use okcvm_git::{EngineState, GitEngine};
use okcvm_llm::ChatDriver;
use okcvm_tools::ToolRegistry;
use okcvm_vm::{HistoryEntry, ToolInvocation, VirtualMachine, VmEvent, VmInfo};
use okcvm_workspace::WorkspaceManager;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Workspace(#[from] okcvm_workspace::WorkspaceError),
    #[error(transparent)]
    Git(#[from] okcvm_git::GitError),
    #[error("chat driver error: {0}")]
    Llm(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("upload '{name}' exceeds the per-file size limit ({size_bytes} bytes)")]
    UploadTooLarge { name: String, size_bytes: u64 },
    #[error("upload would exceed the per-session file count limit")]
    UploadLimitExceeded,
    #[error("duplicate upload name in request: {0}")]
    DuplicateUpload(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub name: String,
    pub relative_path: String,
    pub absolute_path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceState {
    pub enabled: bool,
    pub snapshots: Vec<okcvm_git::Snapshot>,
    pub latest_snapshot: Option<String>,
    pub paths: okcvm_workspace::WorkspacePaths,
    pub git: okcvm_git::EngineStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootPayload {
    pub welcome: String,
    pub workspace: WorkspaceState,
    pub uploads: Vec<Upload>,
    pub vm_info: VmInfo,
}

/// Minimal, deliberately conventional shape scanned out of tool outputs: a
/// tool that wants to surface a live preview, slide deck, or downloadable
/// artifact emits a JSON object (as its `ToolOutput.output` string) carrying
/// a top-level `"type"` discriminator. The concrete tools that produce these
/// shapes are out of scope (§1 — tool business logic); this is the minimal
/// contract `derive_outputs` needs to recognise them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebPreview {
    pub url: String,
    pub deployment_id: String,
    pub title: String,
    #[serde(default)]
    pub html: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PptSlide {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub reply: String,
    pub meta: okcvm_vm::ChatMeta,
    pub tool_calls: Vec<ToolInvocation>,
    pub web_preview: Option<WebPreview>,
    pub ppt_slides: Vec<PptSlide>,
    pub artifacts: Vec<Artifact>,
    pub snapshot: Option<okcvm_git::Snapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPayload {
    pub uploads: Vec<Upload>,
    pub system_prompt: String,
}

struct SessionInner {
    workspace: WorkspaceManager,
    git: GitEngine,
    vm: VirtualMachine,
    uploads: Vec<Upload>,
}

/// One client's facade over its workspace, git engine, and virtual machine.
/// Lazily provisioned on first access; destroyed (and re-provisioned on next
/// access) by [`SessionState::delete_history`].
pub struct SessionState {
    client_id: String,
    storage_root: PathBuf,
    config: ConfigHandle,
    driver: Arc<dyn ChatDriver>,
    registry: Arc<ToolRegistry>,
    system_prompt_template: String,
    inner: Mutex<Option<SessionInner>>,
}

impl SessionState {
    fn new(
        client_id: String,
        storage_root: PathBuf,
        config: ConfigHandle,
        driver: Arc<dyn ChatDriver>,
        registry: Arc<ToolRegistry>,
        system_prompt_template: String,
    ) -> Self {
        Self { client_id, storage_root, config, driver, registry, system_prompt_template, inner: Mutex::new(None) }
    }

    async fn ensure_provisioned(&self, slot: &mut Option<SessionInner>) -> Result<()> {
        if slot.is_some() {
            return Ok(());
        }

        let workspace = WorkspaceManager::provision(&self.storage_root, &self.client_id)?;
        let cfg = self.config.current();

        let git_timeout = Duration::from_secs(cfg.safety.git_init_timeout_secs);
        let internal_root = workspace.paths().internal_root.clone();
        let git = match tokio::time::timeout(git_timeout, GitEngine::init(internal_root.clone())).await {
            Ok(engine) => engine,
            Err(_) => {
                warn!(client_id = %self.client_id, timeout_secs = cfg.safety.git_init_timeout_secs, "git init exceeded startup timeout, disabling snapshot engine");
                GitEngine::disabled(internal_root)
            }
        };

        let namespace = workspace.paths().session_id.clone();
        let adapted_prompt = workspace.adapt_prompt(&self.system_prompt_template);
        let tool_timeout = Duration::from_secs(cfg.safety.tool_timeout_secs);
        let vm = VirtualMachine::new(namespace, adapted_prompt, Arc::clone(&self.driver), Arc::clone(&self.registry), tool_timeout);

        *slot = Some(SessionInner { workspace, git, vm, uploads: Vec::new() });
        Ok(())
    }

    async fn workspace_state(&self, inner: &SessionInner) -> Result<WorkspaceState> {
        if inner.git.state() == EngineState::Disabled {
            return Ok(WorkspaceState {
                enabled: false,
                snapshots: vec![],
                latest_snapshot: None,
                paths: inner.workspace.paths().clone(),
                git: okcvm_git::EngineStatus { commit: None, branch: None, is_dirty: false },
            });
        }

        let snapshots = inner.git.list_snapshots(50).await?;
        let latest_snapshot = snapshots.first().map(|s| s.hash.clone());
        let status = inner.git.describe().await?;
        Ok(WorkspaceState {
            enabled: true,
            snapshots,
            latest_snapshot,
            paths: inner.workspace.paths().clone(),
            git: status,
        })
    }

    pub async fn boot(&self) -> Result<BootPayload> {
        let mut guard = self.inner.lock().await;
        self.ensure_provisioned(&mut guard).await?;
        let inner = guard.as_ref().expect("just provisioned");

        let workspace = self.workspace_state(inner).await?;
        let vm_info = inner.vm.describe(&inner.workspace).await;

        Ok(BootPayload {
            welcome: "Workspace ready. How can I help?".to_string(),
            workspace,
            uploads: inner.uploads.clone(),
            vm_info,
        })
    }

    /// Drives one chat turn: delegates to the VM, derives recognised output
    /// shapes from tool invocations, snapshots the workspace using the user
    /// message as the commit label, and rewrites any deployment/artifact URL
    /// to carry this session's `client_id`.
    pub async fn respond(&self, message: &str, replace_last: bool, on_event: Option<mpsc::Sender<VmEvent>>) -> Result<ChatPayload> {
        let mut guard = self.inner.lock().await;
        self.ensure_provisioned(&mut guard).await?;
        let inner = guard.as_ref().expect("just provisioned");

        let turn = inner.vm.respond(message, replace_last, Some(&inner.workspace), on_event).await?;

        let (web_preview, ppt_slides, artifacts) = derive_outputs(&turn.tool_calls);
        let web_preview = web_preview.map(|wp| with_client_id_on_preview(wp, &self.client_id));
        let artifacts = artifacts.into_iter().map(|a| with_client_id_on_artifact(a, &self.client_id)).collect();

        let snapshot = match inner.git.snapshot(message).await {
            Ok(snapshot) => Some(snapshot),
            Err(okcvm_git::GitError::Disabled) => None,
            Err(e) => return Err(e.into()),
        };

        Ok(ChatPayload { reply: turn.reply, meta: turn.meta, tool_calls: turn.tool_calls, web_preview, ppt_slides, artifacts, snapshot })
    }

    pub async fn upload_files(&self, files: Vec<(String, Vec<u8>)>) -> Result<UploadPayload> {
        let mut guard = self.inner.lock().await;
        self.ensure_provisioned(&mut guard).await?;
        let inner = guard.as_mut().expect("just provisioned");

        let cfg = self.config.current();
        let max_files = cfg.uploads.max_files_per_session;
        let max_bytes = cfg.uploads.max_file_bytes;

        let mut seen = HashSet::new();
        for (name, _) in &files {
            if !seen.insert(name.clone()) {
                return Err(SessionError::DuplicateUpload(name.clone()));
            }
        }
        if inner.uploads.len() + files.len() > max_files {
            return Err(SessionError::UploadLimitExceeded);
        }
        for (name, bytes) in &files {
            if bytes.len() as u64 > max_bytes {
                return Err(SessionError::UploadTooLarge { name: name.clone(), size_bytes: bytes.len() as u64 });
            }
        }

        for (name, bytes) in files {
            let relative_path = format!("uploads/{name}");
            let absolute_path = inner.workspace.resolve(&relative_path)?;
            if let Some(parent) = absolute_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&absolute_path, &bytes)?;
            inner.uploads.push(Upload {
                name,
                relative_path,
                absolute_path: absolute_path.display().to_string(),
                size_bytes: bytes.len() as u64,
            });
        }

        let system_prompt = uploads_prompt_suffix(&inner.uploads);
        Ok(UploadPayload { uploads: inner.uploads.clone(), system_prompt })
    }

    /// Uploads recorded so far for this session, or an empty list if the
    /// session has never been provisioned (matches `list_history`'s
    /// unprovisioned-reads-as-empty contract rather than forcing a boot).
    pub async fn list_uploads(&self) -> Result<Vec<Upload>> {
        let guard = self.inner.lock().await;
        Ok(guard.as_ref().map(|inner| inner.uploads.clone()).unwrap_or_default())
    }

    pub async fn list_history(&self, id: Option<&str>) -> Result<Vec<HistoryEntry>> {
        let guard = self.inner.lock().await;
        let Some(inner) = guard.as_ref() else {
            return Ok(vec![]);
        };
        match id {
            Some(id) => Ok(inner.vm.get_history(id).await.into_iter().collect()),
            None => Ok(inner.vm.recent_history(usize::MAX).await),
        }
    }

    /// Clears history and destroys the workspace (including this session's
    /// deployment directory, named after its session id by convention — the
    /// concrete deployment-naming scheme lives in tool business logic, out of
    /// scope here). Marks the session for lazy re-provision on next access.
    pub async fn delete_history(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(inner) = guard.take() {
            let session_id = inner.workspace.paths().session_id.clone();
            let deployments_root = inner.workspace.paths().deployments_root.clone();
            inner.workspace.cleanup()?;
            let _ = std::fs::remove_dir_all(deployments_root.join(session_id));
        }
        Ok(())
    }

    pub async fn list_snapshots(&self, limit: usize) -> Result<Vec<okcvm_git::Snapshot>> {
        let mut guard = self.inner.lock().await;
        self.ensure_provisioned(&mut guard).await?;
        let inner = guard.as_ref().expect("just provisioned");
        Ok(inner.git.list_snapshots(limit).await?)
    }

    pub async fn create_snapshot(&self, label: &str) -> Result<okcvm_git::Snapshot> {
        let mut guard = self.inner.lock().await;
        self.ensure_provisioned(&mut guard).await?;
        let inner = guard.as_ref().expect("just provisioned");
        Ok(inner.git.snapshot(label).await?)
    }

    pub async fn restore_snapshot(&self, reference: &str, checkout: bool) -> Result<WorkspaceState> {
        let mut guard = self.inner.lock().await;
        self.ensure_provisioned(&mut guard).await?;
        let inner = guard.as_ref().expect("just provisioned");
        inner.git.restore(reference, checkout).await?;
        self.workspace_state(inner).await
    }

    pub async fn assign_branch(&self, name: &str, reference: Option<&str>, checkout: bool) -> Result<()> {
        let mut guard = self.inner.lock().await;
        self.ensure_provisioned(&mut guard).await?;
        let inner = guard.as_ref().expect("just provisioned");
        Ok(inner.git.assign_branch(name, reference, checkout).await?)
    }

    pub async fn workspace_state_summary(&self) -> Result<WorkspaceState> {
        let mut guard = self.inner.lock().await;
        self.ensure_provisioned(&mut guard).await?;
        let inner = guard.as_ref().expect("just provisioned");
        self.workspace_state(inner).await
    }
}

fn uploads_prompt_suffix(uploads: &[Upload]) -> String {
    if uploads.is_empty() {
        return String::new();
    }
    let names: Vec<&str> = uploads.iter().map(|u| u.name.as_str()).collect();
    format!("\n\nThe user has uploaded the following files, available under the workspace mount: {}.", names.join(", "))
}

fn derive_outputs(invocations: &[ToolInvocation]) -> (Option<WebPreview>, Vec<PptSlide>, Vec<Artifact>) {
    let mut web_preview = None;
    let mut ppt_slides = Vec::new();
    let mut artifacts = Vec::new();

    for invocation in invocations {
        let Some(output) = &invocation.output else { continue };
        let Ok(value) = serde_json::from_str::<Value>(output) else { continue };
        let Some(kind) = value.get("type").and_then(Value::as_str) else { continue };

        match kind {
            "web_preview" => {
                if let Ok(preview) = serde_json::from_value::<WebPreview>(value) {
                    web_preview = Some(preview);
                }
            }
            "ppt_slides" => {
                if let Some(slides) = value.get("slides").and_then(Value::as_array) {
                    for slide in slides {
                        if let Ok(slide) = serde_json::from_value::<PptSlide>(slide.clone()) {
                            ppt_slides.push(slide);
                        }
                    }
                }
            }
            "artifact" => {
                if let Ok(artifact) = serde_json::from_value::<Artifact>(value) {
                    artifacts.push(artifact);
                }
            }
            _ => {}
        }
    }

    (web_preview, ppt_slides, artifacts)
}

fn with_client_id(url: &str, client_id: &str) -> String {
    if url.contains('?') {
        format!("{url}&client_id={client_id}")
    } else {
        format!("{url}?client_id={client_id}")
    }
}

fn with_client_id_on_preview(mut preview: WebPreview, client_id: &str) -> WebPreview {
    preview.url = with_client_id(&preview.url, client_id);
    preview
}

fn with_client_id_on_artifact(mut artifact: Artifact, client_id: &str) -> Artifact {
    if let Some(url) = &artifact.url {
        artifact.url = Some(with_client_id(url, client_id));
    }
    artifact
}

/// Maps `ClientId → SessionState` with thread-safe lazy creation. Sessions
/// live for the lifetime of the process once created.
pub struct SessionStore {
    storage_root: PathBuf,
    config: ConfigHandle,
    driver: Arc<dyn ChatDriver>,
    registry: Arc<ToolRegistry>,
    system_prompt_template: String,
    sessions: dashmap::DashMap<String, Arc<SessionState>>,
}

impl SessionStore {
    pub fn new(
        storage_root: impl Into<PathBuf>,
        config: ConfigHandle,
        driver: Arc<dyn ChatDriver>,
        registry: Arc<ToolRegistry>,
        system_prompt_template: impl Into<String>,
    ) -> Self {
        Self {
            storage_root: storage_root.into(),
            config,
            driver,
            registry,
            system_prompt_template: system_prompt_template.into(),
            sessions: dashmap::DashMap::new(),
        }
    }

    /// Returns the cached session for `client_id`, constructing one under
    /// that key's shard lock if absent.
    pub fn get(&self, client_id: &str) -> Arc<SessionState> {
        Arc::clone(self.sessions.entry(client_id.to_string()).or_insert_with(|| {
            Arc::new(SessionState::new(
                client_id.to_string(),
                self.storage_root.clone(),
                self.config.clone(),
                Arc::clone(&self.driver),
                Arc::clone(&self.registry),
                self.system_prompt_template.clone(),
            ))
        }))
    }

    /// Removes `client_id` from the map. Callers are responsible for tearing
    /// down the session's workspace (e.g. via `delete_history`) first.
    pub fn drop_session(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }
}
