//! Per-session sandbox directories and path confinement (spec component A).
//!
//! Every session gets a real directory tree on disk plus a virtual mount
//! path the agent is told about (`/mnt/okcvm-xxxx/`). [`WorkspaceManager`]
//! is the only thing allowed to turn an agent- or tool-supplied path into a
//! real filesystem path; nothing downstream should call `std::fs` against a
//! raw, unvalidated string.
//!
//! Grounded on the confinement pattern the spec's own design notes (§9) call
//! for — canonicalize, then re-check descendancy, never trust prefix
//! matching on the input string alone — generalising the implicit
//! `workspace_root` trust boundary `aigent-exec::ExecutionPolicy` assumed
//! its tools already respected.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("path escapes workspace boundary: {0}")]
    PathEscape(String),
    #[error("workspace I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Legacy mount placeholders that may appear in a system prompt template and
/// must be rewritten to the session's real mount before the prompt is
/// handed to the LLM driver (§3 invariant: "no legacy placeholders remain").
const LEGACY_MOUNT_PLACEHOLDERS: &[&str] = &["/mnt/okcomputer/", "/mnt/okcvm/", "{{mount}}"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub session_id: String,
    /// Virtual path shown to the agent, e.g. `/mnt/okcvm-a1b2c3d4/`.
    pub mount: String,
    /// `mount` + `"output/"` — where the agent is told to place deliverables.
    pub output: String,
    /// Real filesystem root for this session's sandbox.
    pub internal_root: PathBuf,
    pub internal_mount: PathBuf,
    pub internal_output: PathBuf,
    pub internal_tmp: PathBuf,
    pub storage_root: PathBuf,
    pub deployments_root: PathBuf,
}

/// Generates an 8 hex-character session id, e.g. `a1b2c3d4`.
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// Owns one session's sandbox directory tree and resolves paths into it.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    paths: WorkspacePaths,
}

impl WorkspaceManager {
    /// Allocate a fresh sandbox under `<storage_root>/<client_id>/`.
    ///
    /// Creates `<internal_root>/{mnt,output,tmp}` on disk. `deployments_root`
    /// is a sibling directory (`<storage_root>/<client_id>/deployments/`)
    /// shared across that client's sessions, per §6.4.
    pub fn provision(storage_root: impl AsRef<Path>, client_id: &str) -> Result<Self> {
        let storage_root = storage_root.as_ref().to_path_buf();
        let session_id = generate_session_id();

        let client_root = storage_root.join(client_id);
        let internal_root = client_root.join(&session_id);
        let internal_mount = internal_root.join("mnt");
        let internal_output = internal_mount.join("output");
        let internal_tmp = internal_root.join("tmp");
        let deployments_root = client_root.join("deployments");

        fs::create_dir_all(&internal_mount)?;
        fs::create_dir_all(&internal_output)?;
        fs::create_dir_all(&internal_tmp)?;
        fs::create_dir_all(&deployments_root)?;

        let mount = format!("/mnt/okcvm-{session_id}/");
        let output = format!("{mount}output/");

        tracing::info!(session_id = %session_id, root = %internal_root.display(), "provisioned workspace");

        Ok(Self {
            paths: WorkspacePaths {
                session_id,
                mount,
                output,
                internal_root,
                internal_mount,
                internal_output,
                internal_tmp,
                storage_root,
                deployments_root,
            },
        })
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    /// Resolve a user- or tool-supplied path (absolute or relative, `/` or
    /// `\` separated, possibly carrying the public mount prefix) into a real
    /// filesystem path strictly under `internal_root`.
    ///
    /// Canonicalization happens on the *existing-ancestor* portion of the
    /// path so callers can resolve a path that doesn't exist yet (e.g. for a
    /// file about to be created); the descendancy check is re-applied after
    /// canonicalization so a symlink cannot be used to walk out of the
    /// sandbox (§9 "Workspace escape via symlinks").
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let normalized = raw.replace('\\', "/");
        let stripped = normalized
            .strip_prefix(&self.paths.mount)
            .or_else(|| normalized.strip_prefix(self.paths.mount.trim_end_matches('/')))
            .unwrap_or(normalized.as_str());

        let stripped = stripped.trim_start_matches('/');
        let mut joined = self.paths.internal_mount.clone();
        for component in Path::new(stripped).components() {
            match component {
                Component::Normal(part) => joined.push(part),
                Component::ParentDir => joined.push(".."),
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => {
                    return Err(WorkspaceError::PathEscape(raw.to_string()));
                }
            }
        }

        let canonical_root = self.canonical_or_self(&self.paths.internal_mount)?;
        let canonical_target = self.canonicalize_existing_ancestor(&joined)?;

        if !canonical_target.starts_with(&canonical_root) {
            return Err(WorkspaceError::PathEscape(raw.to_string()));
        }

        Ok(canonical_target)
    }

    /// Canonicalize `path`, falling back to the path itself if it doesn't
    /// exist yet (fresh workspaces have no `.git` or output file yet).
    fn canonical_or_self(&self, path: &Path) -> Result<PathBuf> {
        match path.canonicalize() {
            Ok(p) => Ok(p),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(path.to_path_buf()),
            Err(e) => Err(e.into()),
        }
    }

    /// Canonicalize the longest existing prefix of `path`, then re-append
    /// the remaining (not-yet-existing) components untouched. This lets a
    /// `write_file` call resolve a path whose parent exists but whose leaf
    /// doesn't, while still catching `..`/symlink escapes in the existing
    /// portion.
    fn canonicalize_existing_ancestor(&self, path: &Path) -> Result<PathBuf> {
        let mut existing = path.to_path_buf();
        let mut suffix: Vec<std::ffi::OsString> = Vec::new();

        loop {
            match existing.canonicalize() {
                Ok(canonical) => {
                    let mut result = canonical;
                    for part in suffix.into_iter().rev() {
                        result.push(part);
                    }
                    return Ok(result);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let Some(file_name) = existing.file_name() else {
                        // Ran out of path to strip; nothing exists on disk at
                        // all (brand-new workspace) — fall back to a lexical
                        // join relative to the (existing) internal_mount.
                        return Ok(path.to_path_buf());
                    };
                    suffix.push(file_name.to_os_string());
                    existing = existing
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.paths.internal_mount.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Replace any legacy mount placeholder in `prompt` with this session's
    /// real mount path.
    pub fn adapt_prompt(&self, prompt: &str) -> String {
        let mut adapted = prompt.to_string();
        for placeholder in LEGACY_MOUNT_PLACEHOLDERS {
            adapted = adapted.replace(placeholder, &self.paths.mount);
        }
        adapted
    }

    /// Recursively remove the session's sandbox directory. Idempotent: a
    /// missing directory is success, not an error.
    pub fn cleanup(&self) -> Result<()> {
        match fs::remove_dir_all(&self.paths.internal_root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provision() -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::provision(dir.path(), "client-a").unwrap();
        (dir, manager)
    }

    #[test]
    fn provision_creates_expected_tree() {
        let (_dir, manager) = provision();
        let paths = manager.paths();
        assert!(paths.internal_mount.is_dir());
        assert!(paths.internal_output.is_dir());
        assert!(paths.internal_tmp.is_dir());
        assert!(paths.deployments_root.is_dir());
        assert!(paths.mount.starts_with("/mnt/okcvm-"));
        assert_eq!(paths.session_id.len(), 8);
    }

    #[test]
    fn resolve_relative_path_stays_inside_mount() {
        let (_dir, manager) = provision();
        let resolved = manager.resolve("notes.txt").unwrap();
        assert!(resolved.starts_with(&manager.paths().internal_mount));
    }

    #[test]
    fn resolve_strips_public_mount_prefix() {
        let (_dir, manager) = provision();
        let mount = manager.paths().mount.clone();
        let resolved = manager.resolve(&format!("{mount}output/report.pdf")).unwrap();
        assert!(resolved.starts_with(&manager.paths().internal_output));
    }

    #[test]
    fn resolve_accepts_windows_separators() {
        let (_dir, manager) = provision();
        let resolved = manager.resolve("sub\\dir\\file.txt").unwrap();
        assert!(resolved.ends_with("sub/dir/file.txt") || resolved.ends_with("sub\\dir\\file.txt"));
        assert!(resolved.starts_with(&manager.paths().internal_mount));
    }

    #[test]
    fn resolve_rejects_parent_dir_escape() {
        let (_dir, manager) = provision();
        let err = manager.resolve("../../etc/passwd").unwrap_err();
        assert!(matches!(err, WorkspaceError::PathEscape(_)));
    }

    #[test]
    fn resolve_confines_absolute_path_under_root() {
        let (_dir, manager) = provision();
        let resolved = manager.resolve("/etc/passwd").unwrap();
        assert!(resolved.starts_with(&manager.paths().internal_mount));
    }

    #[test]
    fn resolve_rejects_symlink_escape() {
        let (dir, manager) = provision();
        let outside = dir.path().join("outside-secret");
        std::fs::write(&outside, b"secret").unwrap();

        #[cfg(unix)]
        {
            let link = manager.paths().internal_mount.join("escape");
            std::os::unix::fs::symlink(&outside, &link).unwrap();
            let err = manager.resolve("escape").unwrap_err();
            assert!(matches!(err, WorkspaceError::PathEscape(_)));
        }
    }

    #[test]
    fn adapt_prompt_rewrites_legacy_mount() {
        let (_dir, manager) = provision();
        let prompt = "Files live under /mnt/okcomputer/ for this session.";
        let adapted = manager.adapt_prompt(prompt);
        assert!(adapted.contains(&manager.paths().mount));
        assert!(!adapted.contains("/mnt/okcomputer/"));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let (_dir, manager) = provision();
        manager.cleanup().unwrap();
        assert!(!manager.paths().internal_root.exists());
        manager.cleanup().unwrap();
    }
}
