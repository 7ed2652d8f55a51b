//! `okcvm server` — loads config, wires the kernel's components together,
//! and serves the HTTP surface. Generalises `aigent-app`'s single-binary
//! `Cli`/`Subcommand` entrypoint (`crates/aigent-app/src/main.rs`) down to
//! the one subcommand this kernel exposes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use okcvm_config::{AppConfig, ConfigHandle};
use okcvm_llm::{LlmRouter, Provider};
use okcvm_session::SessionStore;
use okcvm_store::ConversationStore;
use okcvm_tools::builtins::{ReadFileTool, RunShellTool, WriteFileTool};
use okcvm_tools::ToolRegistry;

const SYSTEM_PROMPT_TEMPLATE: &str = "You are OK Computer, an AI that works inside its own virtual computer. \
Your workspace is mounted at {{mount}}; write and read files there. \
Be direct, show your work through tool calls, and narrate what you changed.";

#[derive(Debug, Parser)]
#[command(name = "okcvm", version, about = "OK Computer VM session kernel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the HTTP server.
    Server {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,
        /// Poll the config file for changes and hot-reload it while running.
        #[arg(long)]
        reload: bool,
    },
}

fn main() -> std::process::ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let Commands::Server { host, port, config, reload } = cli.command;

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start tokio runtime");
            return std::process::ExitCode::from(1);
        }
    };

    match runtime.block_on(run_server(config, host, port, reload)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server exited with error");
            if e.downcast_ref::<PortInUse>().is_some() {
                std::process::ExitCode::from(2)
            } else {
                std::process::ExitCode::from(1)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("port already in use")]
struct PortInUse;

async fn run_server(config_path: PathBuf, host_override: Option<String>, port_override: Option<u16>, reload: bool) -> Result<()> {
    let mut config = AppConfig::load_from(&config_path).map_err(|e| anyhow::anyhow!("invalid configuration at {}: {e}", config_path.display()))?;

    if let Some(host) = host_override {
        config.server.host = host;
    }
    if let Some(port) = port_override {
        config.server.port = port;
    }

    if config.llm.provider.is_empty() || config.llm.model.is_empty() {
        bail!("invalid configuration: llm.provider and llm.model are required");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let config_handle = ConfigHandle::new(config);

    if reload {
        spawn_config_reloader(config_path.clone(), config_handle.clone());
    }

    let snapshot = config_handle.current();
    let provider = match snapshot.llm.provider.as_str() {
        "ollama" => Provider::Ollama,
        "openrouter" => Provider::OpenRouter,
        other => bail!("invalid configuration: unknown llm provider '{other}'"),
    };
    let driver = Arc::new(LlmRouter::new(provider, snapshot.llm.model.clone(), snapshot.llm.api_key.clone(), snapshot.llm.base_url.clone()));

    let mut registry = ToolRegistry::new();
    registry.register(Box::new(ReadFileTool));
    registry.register(Box::new(WriteFileTool));
    if snapshot.safety.allow_shell {
        registry.register(Box::new(RunShellTool));
    }
    let registry = Arc::new(registry);

    let sessions = Arc::new(SessionStore::new(
        snapshot.storage.storage_root.clone(),
        config_handle.clone(),
        driver,
        registry,
        SYSTEM_PROMPT_TEMPLATE,
    ));
    let conversations = Arc::new(ConversationStore::open(snapshot.storage.database_path.clone()).await?);

    let state = okcvm_http::AppState::new(sessions, conversations, config_handle);
    let app = okcvm_http::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            anyhow::Error::new(PortInUse)
        } else {
            anyhow::Error::from(e)
        }
    })?;

    tracing::info!(addr = %bind_addr, "okcvm server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Polls the config file's mtime every few seconds and publishes a fresh
/// snapshot on change — deliberately simple (no `notify` filesystem watcher
/// dependency) since config edits are rare and a short delay is acceptable.
fn spawn_config_reloader(path: PathBuf, handle: ConfigHandle) {
    tokio::spawn(async move {
        let mut last_modified = mtime(&path);
        loop {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let current = mtime(&path);
            if current != last_modified {
                last_modified = current;
                match AppConfig::load_from(&path) {
                    Ok(config) => {
                        handle.update(config);
                        tracing::info!(path = %path.display(), "reloaded configuration");
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to reload configuration, keeping previous snapshot");
                    }
                }
            }
        }
    });
}

fn mtime(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}
