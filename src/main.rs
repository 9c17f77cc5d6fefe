use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;

use markdown_qa::config::{CliOverrides, ServerConfig};
use markdown_qa::config_watcher::ConfigWatcher;
use markdown_qa::index_manager::RefreshResult;
use markdown_qa::scheduler::ReloadScheduler;
use markdown_qa::server;
use markdown_qa::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "mdqa-server", version, about = "Markdown Q&A WebSocket server")]
struct Cli {
    /// WebSocket server port (overrides config file, default: 8765)
    #[arg(long)]
    port: Option<u16>,

    /// Directories to index (space-separated, overrides config file)
    #[arg(long, num_args = 1..)]
    directories: Option<Vec<String>>,

    /// Index reload interval in seconds (overrides config file, default: 300)
    #[arg(long)]
    reload_interval: Option<u64>,

    /// Index name (overrides config file, default: "default")
    #[arg(long)]
    index_name: Option<String>,

    /// Cache directory (default: ~/.markdown-qa/cache)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Explicit config file path (default: ~/.markdown-qa/config.yaml|toml)
    #[arg(long)]
    config_file: Option<PathBuf>,
}

impl Cli {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            port: self.port,
            directories: self.directories,
            reload_interval: self.reload_interval,
            index_name: self.index_name,
            cache_dir: self.cache_dir,
            config_file: self.config_file,
        }
    }
}

fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = std::env::var("MARKDOWN_QA_LOG_DIR").unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|d| d.join(".markdown-qa").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".markdown-qa/logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "mdqa-server.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "markdown_qa=info,mdqa_server=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Panics should land in the logs before the process dies.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        error!(target: "mdqa_server::panic", location = %location, "thread panicked: {}", panic_info);
        default_panic(panic_info);
    }));

    guard
}

fn refresh_once(state: &AppState) {
    let (index_name, directories) = {
        let config = state.config.read();
        (config.index_name.clone(), config.directories.clone())
    };
    match state.index_manager.refresh(&index_name, &directories) {
        Ok(RefreshResult::NoChange) => {
            debug!("no changes detected, skipping reload");
        }
        Ok(RefreshResult::Incremental {
            added,
            modified,
            deleted,
        }) => {
            info!(
                "incremental update completed: {} added, {} modified, {} deleted",
                added.len(),
                modified.len(),
                deleted.len()
            );
            if !added.is_empty() {
                info!("  added: {:?}", added);
            }
            if !modified.is_empty() {
                info!("  modified: {:?}", modified);
            }
            if !deleted.is_empty() {
                info!("  deleted: {:?}", deleted);
            }
        }
        Ok(RefreshResult::FullRebuild { reason }) => {
            info!("performed full rebuild (reason: {})", reason);
        }
        Err(e) => {
            error!("error reloading indexes: {}", e);
        }
    }
}

/// Re-resolve the configuration and reconcile the running server with it.
/// Called from the config watcher thread; the blocking index work is fine
/// there.
fn apply_config_reload(state: &AppState, overrides: &CliOverrides) {
    let newer = match ServerConfig::load(overrides) {
        Ok(config) => config,
        Err(e) => {
            warn!("ignoring config reload, file is unusable: {}", e);
            return;
        }
    };

    let older = state.config.read().clone();
    let diff = older.diff(&newer);
    if !diff.has_changes() {
        return;
    }
    info!("configuration reloaded, changed: {}", diff.changed.join(", "));

    if diff.requires_restart {
        warn!("port change detected; restart required for it to take effect");
    }
    if diff.changed.contains(&"api") {
        warn!("api settings changed; restart required for new providers");
    }
    if diff.changed.contains(&"cache_dir") {
        warn!("cache directory changed; restart required for it to take effect");
    }
    if diff.changed.contains(&"reload_interval") {
        warn!("reload interval changed; applies after restart");
    }

    let index_name = newer.index_name.clone();
    let directories = newer.directories.clone();
    let index_renamed = diff.changed.contains(&"index_name");
    let directories_changed = diff.changed.contains(&"directories");
    *state.config.write() = newer;

    if index_renamed || diff.directories_removed {
        // Removed roots leave orphaned records behind; a renamed index has
        // no usable on-disk state. Both get a clean rebuild.
        info!("rebuilding index '{}' after configuration change", index_name);
        if let Err(e) = state.index_manager.rebuild(&index_name, &directories) {
            error!("rebuild after config change failed: {}", e);
        }
    } else if directories_changed {
        // Pure additions: their files surface as `added` on a refresh.
        refresh_once(state);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let overrides = Cli::parse().into_overrides();
    let _log_guard = init_tracing();

    let config = ServerConfig::load(&overrides)?;
    let addr: SocketAddr = format!("127.0.0.1:{}", config.port).parse()?;

    info!(
        port = config.port,
        index_name = %config.index_name,
        directories = ?config.directories,
        reload_interval_secs = config.reload_interval_secs,
        cache_root = %config.cache_root.display(),
        "mdqa-server starting"
    );

    let state = AppState::new(config)?;

    // Indexes must be usable before the listener accepts queries.
    {
        let config = state.config.read().clone();
        info!("loading indexes for directories: {:?}", config.directories);
        state
            .index_manager
            .load_or_build(&config.index_name, &config.directories)?;
    }
    if !state.index_manager.is_ready() {
        anyhow::bail!("failed to load indexes at startup");
    }
    info!("indexes loaded successfully");

    let reload_interval = state.config.read().reload_interval_secs.max(1);
    let scheduler_state = state.clone();
    let scheduler = ReloadScheduler::start(
        Duration::from_secs(reload_interval),
        Arc::new(move || refresh_once(&scheduler_state)),
    );

    let _config_watcher = match state.config.read().config_file_path() {
        Some(path) => {
            let watcher_state = state.clone();
            let watcher_overrides = overrides.clone();
            match ConfigWatcher::start(
                path,
                Arc::new(move || apply_config_reload(&watcher_state, &watcher_overrides)),
            ) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("config watcher could not start: {}", e);
                    None
                }
            }
        }
        None => None,
    };

    let app = server::create_app(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("server ready and listening on ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); }
        _ = terminate => { info!("received terminate signal, shutting down"); }
    }
}
