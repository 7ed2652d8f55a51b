//! Resolved configuration for the OK Computer VM session kernel.
//!
//! The kernel never parses config files itself (out of scope, §1): callers
//! hand it an already-resolved [`AppConfig`]. What the kernel *does* own is
//! making that config available to many concurrent request handlers without
//! a reader ever blocking behind a writer — config changes (`POST
//! /api/config`) are rare; config reads happen on every request.
//!
//! Modelled as an atomic-swap pointer to an immutable snapshot: readers call
//! [`ConfigHandle::current`] once at request entry and use that snapshot for
//! the rest of the request, so a concurrent `POST /api/config` can never
//! produce a torn read.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    /// Never serialised back out in full — see [`AppConfig::redacted`].
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "llama3.1:8b".to_string(),
            api_key: None,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory under which `<client_id>/<session_id>/{mnt,output,tmp,.git}`
    /// trees and `<client_id>/deployments/<id>/` directories are created.
    pub storage_root: String,
    /// Path to the conversation database file.
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_root: "./okcvm-data/workspaces".to_string(),
            database_path: "./okcvm-data/conversations.sqlite3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub allow_shell: bool,
    /// Explicit allow-list of tool names. Empty = all tools are eligible.
    pub tool_allowlist: Vec<String>,
    /// Explicit deny-list of tool names. Takes precedence over the allow-list.
    pub tool_denylist: Vec<String>,
    /// Per-tool execution timeout in seconds (§5 Timeouts).
    pub tool_timeout_secs: u64,
    /// Timeout for the startup `git init`, past which the snapshot engine
    /// falls back to the null/disabled engine for that session (§5 Timeouts).
    pub git_init_timeout_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            allow_shell: true,
            tool_allowlist: vec![],
            tool_denylist: vec![],
            tool_timeout_secs: 60,
            git_init_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_files_per_session: usize,
    pub max_file_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_files_per_session: 100,
            max_file_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub storage: StorageConfig,
    pub safety: SafetyConfig,
    pub telemetry: TelemetryConfig,
    pub uploads: UploadConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        std::fs::write(path, rendered)?;
        Ok(())
    }

    /// A copy suitable for `GET /api/config`: the API key is replaced with a
    /// presence marker rather than echoed back in plain text.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.llm.api_key.is_some() {
            copy.llm.api_key = Some("<redacted>".to_string());
        }
        copy
    }

    /// Apply a partial patch: fields omitted in `patch` keep their current
    /// value (we merge at the section granularity, matching the "omit to
    /// keep" contract of `POST /api/config` in §6.1 — a caller who wants to
    /// clear `api_key` sends `llm.api_key = null` explicitly, which
    /// `Option<String>` already expresses since `serde` defaults the field
    /// to `None` only when the whole `llm` object — or the key itself — is
    /// present and explicitly null).
    pub fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(server) = patch.server {
            self.server = server;
        }
        if let Some(llm) = patch.llm {
            self.llm = llm;
        }
        if let Some(storage) = patch.storage {
            self.storage = storage;
        }
        if let Some(safety) = patch.safety {
            self.safety = safety;
        }
        if let Some(telemetry) = patch.telemetry {
            self.telemetry = telemetry;
        }
        if let Some(uploads) = patch.uploads {
            self.uploads = uploads;
        }
    }
}

/// Request body for `POST /api/config`. Every field is optional; an absent
/// section is left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub server: Option<ServerConfig>,
    pub llm: Option<LlmConfig>,
    pub storage: Option<StorageConfig>,
    pub safety: Option<SafetyConfig>,
    pub telemetry: Option<TelemetryConfig>,
    pub uploads: Option<UploadConfig>,
}

/// Process-wide handle to the current config snapshot.
///
/// Cloning a `ConfigHandle` is cheap (it's an `Arc` around the `ArcSwap`);
/// every session and HTTP handler holds one. `current()` never blocks.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<AppConfig>>,
}

impl ConfigHandle {
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Take a snapshot of the current config. The returned `Arc` is
    /// immutable even if a concurrent `update` swaps in a new one.
    pub fn current(&self) -> Arc<AppConfig> {
        self.inner.load_full()
    }

    /// Publish a new config snapshot for subsequent readers.
    pub fn update(&self, config: AppConfig) {
        self.inner.store(Arc::new(config));
        tracing::info!("configuration snapshot updated");
    }

    /// Apply a patch atomically against the currently published snapshot.
    pub fn apply_patch(&self, patch: ConfigPatch) {
        let mut next = (*self.current()).clone();
        next.apply_patch(patch);
        self.update(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = AppConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.storage.storage_root, config.storage.storage_root);
    }

    #[test]
    fn redacted_hides_api_key() {
        let mut config = AppConfig::default();
        config.llm.api_key = Some("sk-super-secret".to_string());
        let redacted = config.redacted();
        assert_eq!(redacted.llm.api_key.as_deref(), Some("<redacted>"));
        // the original is untouched
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-super-secret"));
    }

    #[test]
    fn apply_patch_only_touches_named_sections() {
        let mut config = AppConfig::default();
        config.llm.model = "custom-model".to_string();

        let patch = ConfigPatch {
            server: Some(ServerConfig { host: "0.0.0.0".to_string(), port: 9000 }),
            ..Default::default()
        };
        config.apply_patch(patch);

        assert_eq!(config.server.port, 9000);
        // llm section untouched by a patch that omitted it
        assert_eq!(config.llm.model, "custom-model");
    }

    #[test]
    fn handle_update_is_visible_to_new_snapshots() {
        let handle = ConfigHandle::new(AppConfig::default());
        let before = handle.current();
        assert_eq!(before.server.port, 8080);

        let mut next = (*before).clone();
        next.server.port = 4242;
        handle.update(next);

        let after = handle.current();
        assert_eq!(after.server.port, 4242);
        // the snapshot taken before the update is unaffected
        assert_eq!(before.server.port, 8080);
    }
}
