//! Per-workspace git snapshot engine (spec component B).
//!
//! Generalises `aigent-exec`'s `git_init_if_needed` / `git_auto_commit` /
//! `git_rollback_last` helpers (subprocess `git`, isolated committer
//! identity, non-fatal-by-default error handling) into a full
//! snapshot/list/restore/branch contract. Still shells out to the system
//! `git` binary rather than pulling in `git2`/`gix` — the teacher never
//! needed a git library and a fresh heavyweight dependency isn't justified
//! just to generalise a few subprocess calls.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

const COMMITTER_NAME: &str = "okcvm";
const COMMITTER_EMAIL: &str = "okcvm@localhost";
const MAX_LABEL_LEN: usize = 72;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("snapshot engine is disabled for this workspace (git unavailable at provision time)")]
    Disabled,
    #[error("unknown snapshot reference: {0}")]
    UnknownSnapshot(String),
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("git I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GitError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Ready,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub hash: String,
    pub label: String,
    pub timestamp: DateTime<Utc>,
    pub is_dirty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub is_dirty: bool,
}

/// Owns the git-backed history of one session's workspace.
///
/// `state` is fixed the moment the engine is provisioned: {Uninitialised}
/// collapses into {Ready} or {Disabled} during `init` and never changes
/// again for this engine's lifetime (§4.B state machine). All mutating
/// operations go through `lock` so at most one `git` invocation runs
/// against this workspace at a time.
pub struct GitEngine {
    workspace_root: PathBuf,
    state: EngineState,
    lock: Mutex<()>,
}

impl GitEngine {
    /// Attempts `git init` inside `workspace_root` with an isolated
    /// committer identity. Falls back to a disabled (null) engine when the
    /// `git` binary is missing or `init` fails — the rest of the system
    /// keeps working, snapshot operations just report `Disabled`.
    pub async fn init(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();

        if workspace_root.join(".git").exists() {
            info!(workspace = %workspace_root.display(), "reusing existing git repository");
            return Self { workspace_root, state: EngineState::Ready, lock: Mutex::new(()) };
        }

        let result = Command::new("git")
            .args(["init"])
            .current_dir(&workspace_root)
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                info!(workspace = %workspace_root.display(), "initialised git repository");
                Self { workspace_root, state: EngineState::Ready, lock: Mutex::new(()) }
            }
            Ok(output) => {
                warn!(stderr = %String::from_utf8_lossy(&output.stderr), "git init failed, disabling snapshot engine");
                Self { workspace_root, state: EngineState::Disabled, lock: Mutex::new(()) }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("git binary not found, disabling snapshot engine");
                Self { workspace_root, state: EngineState::Disabled, lock: Mutex::new(()) }
            }
            Err(e) => {
                warn!(error = %e, "git init I/O error, disabling snapshot engine");
                Self { workspace_root, state: EngineState::Disabled, lock: Mutex::new(()) }
            }
        }
    }

    /// Constructs an engine already in the `Disabled` state. Used by callers
    /// that enforce their own timeout around `init` (§5's 5s startup budget)
    /// and want to fall back to the null engine without waiting for a `git`
    /// subprocess that may never return.
    pub fn disabled(workspace_root: impl Into<PathBuf>) -> Self {
        Self { workspace_root: workspace_root.into(), state: EngineState::Disabled, lock: Mutex::new(()) }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    fn require_ready(&self) -> Result<()> {
        match self.state {
            EngineState::Ready => Ok(()),
            EngineState::Disabled => Err(GitError::Disabled),
        }
    }

    fn truncate_label(label: &str) -> &str {
        if label.len() <= MAX_LABEL_LEN {
            return label;
        }
        let mut end = MAX_LABEL_LEN;
        while end > 0 && !label.is_char_boundary(end) {
            end -= 1;
        }
        &label[..end]
    }

    fn committer_env(cmd: &mut Command) {
        cmd.env("GIT_AUTHOR_NAME", COMMITTER_NAME)
            .env("GIT_AUTHOR_EMAIL", COMMITTER_EMAIL)
            .env("GIT_COMMITTER_NAME", COMMITTER_NAME)
            .env("GIT_COMMITTER_EMAIL", COMMITTER_EMAIL);
    }

    /// Stage everything and commit with `label` (empty commits are allowed;
    /// callers distinguish via `is_dirty` on the returned snapshot — it
    /// reflects whether there was anything staged, not whether the commit
    /// itself succeeded as non-empty).
    pub async fn snapshot(&self, label: &str) -> Result<Snapshot> {
        self.require_ready()?;
        let _guard = self.lock.lock().await;

        let add = Command::new("git")
            .args(["add", "-A"])
            .current_dir(&self.workspace_root)
            .output()
            .await?;
        if !add.status.success() {
            return Err(GitError::CommandFailed(String::from_utf8_lossy(&add.stderr).trim().to_string()));
        }

        let diff = Command::new("git")
            .args(["diff", "--cached", "--quiet"])
            .current_dir(&self.workspace_root)
            .status()
            .await?;
        let is_dirty = !diff.success();

        let label = Self::truncate_label(label);
        let message = if label.is_empty() { format!("snapshot {}", Utc::now().to_rfc3339()) } else { label.to_string() };

        let mut commit_cmd = Command::new("git");
        commit_cmd
            .args(["commit", "--allow-empty", "-m", &message, "--no-verify"])
            .current_dir(&self.workspace_root);
        Self::committer_env(&mut commit_cmd);
        let commit = commit_cmd.output().await?;
        if !commit.status.success() {
            return Err(GitError::CommandFailed(String::from_utf8_lossy(&commit.stderr).trim().to_string()));
        }

        let hash = self.current_commit_hash().await?;
        info!(hash = %hash, label = %message, "snapshot created");

        Ok(Snapshot { hash, label: message, timestamp: Utc::now(), is_dirty })
    }

    async fn current_commit_hash(&self) -> Result<String> {
        let out = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.workspace_root)
            .output()
            .await?;
        if !out.status.success() {
            return Err(GitError::CommandFailed(String::from_utf8_lossy(&out.stderr).trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Most recent snapshots first, capped at `limit`.
    pub async fn list_snapshots(&self, limit: usize) -> Result<Vec<Snapshot>> {
        self.require_ready()?;
        let _guard = self.lock.lock().await;

        let format = "%H%x1f%s%x1f%cI";
        let out = Command::new("git")
            .args(["log", &format!("-{limit}"), &format!("--format={format}")])
            .current_dir(&self.workspace_root)
            .output()
            .await?;
        if !out.status.success() {
            // no commits yet is reported as a non-zero status by some git
            // versions; treat as an empty history rather than an error.
            return Ok(Vec::new());
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        let mut snapshots = Vec::new();
        for line in stdout.lines() {
            let mut parts = line.splitn(3, '\u{1f}');
            let (Some(hash), Some(label), Some(timestamp)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            let timestamp = DateTime::parse_from_rfc3339(timestamp)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            snapshots.push(Snapshot {
                hash: hash.to_string(),
                label: label.to_string(),
                timestamp,
                is_dirty: false,
            });
        }
        Ok(snapshots)
    }

    /// `git reset --hard <ref>` then clean untracked files. `ref` may be a
    /// commit hash or branch name. When `checkout` is true and `ref` names a
    /// branch, switches HEAD to that branch first.
    pub async fn restore(&self, reference: &str, checkout: bool) -> Result<()> {
        self.require_ready()?;
        let _guard = self.lock.lock().await;

        if !self.ref_exists(reference).await? {
            return Err(GitError::UnknownSnapshot(reference.to_string()));
        }

        if checkout && self.is_branch(reference).await? {
            let switch = Command::new("git")
                .args(["checkout", reference])
                .current_dir(&self.workspace_root)
                .output()
                .await?;
            if !switch.status.success() {
                return Err(GitError::CommandFailed(String::from_utf8_lossy(&switch.stderr).trim().to_string()));
            }
        }

        let reset = Command::new("git")
            .args(["reset", "--hard", reference])
            .current_dir(&self.workspace_root)
            .output()
            .await?;
        if !reset.status.success() {
            return Err(GitError::CommandFailed(String::from_utf8_lossy(&reset.stderr).trim().to_string()));
        }

        let clean = Command::new("git")
            .args(["clean", "-fd"])
            .current_dir(&self.workspace_root)
            .output()
            .await?;
        if !clean.status.success() {
            warn!(stderr = %String::from_utf8_lossy(&clean.stderr), "git clean failed (non-fatal)");
        }

        info!(reference, "workspace restored");
        Ok(())
    }

    /// Create or move branch `name` to `reference` (defaults to HEAD).
    pub async fn assign_branch(&self, name: &str, reference: Option<&str>, checkout: bool) -> Result<()> {
        self.require_ready()?;
        let _guard = self.lock.lock().await;

        let target = reference.unwrap_or("HEAD");
        let force_branch = Command::new("git")
            .args(["branch", "-f", name, target])
            .current_dir(&self.workspace_root)
            .output()
            .await?;
        if !force_branch.status.success() {
            return Err(GitError::CommandFailed(String::from_utf8_lossy(&force_branch.stderr).trim().to_string()));
        }

        if checkout {
            let switch = Command::new("git")
                .args(["checkout", name])
                .current_dir(&self.workspace_root)
                .output()
                .await?;
            if !switch.status.success() {
                return Err(GitError::CommandFailed(String::from_utf8_lossy(&switch.stderr).trim().to_string()));
            }
        }

        info!(branch = name, target, "branch assigned");
        Ok(())
    }

    /// Current commit, current branch (`None` when detached), and whether
    /// the working tree has uncommitted changes.
    pub async fn describe(&self) -> Result<EngineStatus> {
        if self.state == EngineState::Disabled {
            return Ok(EngineStatus { commit: None, branch: None, is_dirty: false });
        }
        let _guard = self.lock.lock().await;

        let commit = self.current_commit_hash().await.ok();

        let branch_out = Command::new("git")
            .args(["symbolic-ref", "--short", "-q", "HEAD"])
            .current_dir(&self.workspace_root)
            .output()
            .await?;
        let branch = if branch_out.status.success() {
            let name = String::from_utf8_lossy(&branch_out.stdout).trim().to_string();
            if name.is_empty() { None } else { Some(name) }
        } else {
            None
        };

        let status_out = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.workspace_root)
            .output()
            .await?;
        let is_dirty = status_out.status.success() && !status_out.stdout.is_empty();

        Ok(EngineStatus { commit, branch, is_dirty })
    }

    async fn ref_exists(&self, reference: &str) -> Result<bool> {
        let out = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("{reference}^{{commit}}")])
            .current_dir(&self.workspace_root)
            .output()
            .await?;
        Ok(out.status.success())
    }

    async fn is_branch(&self, reference: &str) -> Result<bool> {
        let out = Command::new("git")
            .args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{reference}")])
            .current_dir(&self.workspace_root)
            .output()
            .await?;
        Ok(out.status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> (tempfile::TempDir, GitEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = GitEngine::init(dir.path()).await;
        (dir, engine)
    }

    #[tokio::test]
    async fn init_produces_ready_engine() {
        let (_dir, engine) = engine().await;
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn snapshot_then_list_round_trips() {
        let (dir, engine) = engine().await;
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let snap = engine.snapshot("first snapshot").await.unwrap();
        assert!(snap.is_dirty);

        let snapshots = engine.list_snapshots(10).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].hash, snap.hash);
        assert_eq!(snapshots[0].label, "first snapshot");
    }

    #[tokio::test]
    async fn empty_snapshot_is_not_dirty() {
        let (_dir, engine) = engine().await;
        let snap = engine.snapshot("empty").await.unwrap();
        assert!(!snap.is_dirty);
    }

    #[tokio::test]
    async fn restore_resets_working_tree() {
        let (dir, engine) = engine().await;
        std::fs::write(dir.path().join("a.txt"), b"v1").unwrap();
        let first = engine.snapshot("v1").await.unwrap();

        std::fs::write(dir.path().join("a.txt"), b"v2").unwrap();
        engine.snapshot("v2").await.unwrap();

        engine.restore(&first.hash, false).await.unwrap();
        let contents = std::fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert_eq!(contents, "v1");
    }

    #[tokio::test]
    async fn restore_unknown_ref_errors() {
        let (_dir, engine) = engine().await;
        engine.snapshot("first").await.unwrap();
        let err = engine.restore("not-a-real-ref", false).await.unwrap_err();
        assert!(matches!(err, GitError::UnknownSnapshot(_)));
    }

    #[tokio::test]
    async fn assign_branch_and_checkout() {
        let (_dir, engine) = engine().await;
        engine.snapshot("first").await.unwrap();
        engine.assign_branch("feature-x", None, true).await.unwrap();

        let status = engine.describe().await.unwrap();
        assert_eq!(status.branch.as_deref(), Some("feature-x"));
    }

    #[tokio::test]
    async fn disabled_engine_reports_disabled_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = GitEngine {
            workspace_root: dir.path().to_path_buf(),
            state: EngineState::Disabled,
            lock: Mutex::new(()),
        };
        let err = engine.snapshot("x").await.unwrap_err();
        assert!(matches!(err, GitError::Disabled));
    }
}
