//! Server and API configuration.
//!
//! Precedence, highest first: command-line overrides, config file
//! (`~/.markdown-qa/config.yaml` or `config.toml`), environment variables,
//! built-in defaults. The loaded struct is what the core consumes; reloading
//! re-runs the same resolution and diffs against the previous result so the
//! server can decide between an incremental refresh and a full rebuild.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::{AppError, AppResult};

pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_RELOAD_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_INDEX_NAME: &str = "default";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TOP_K: usize = 5;

/// Connection settings for the OpenAI-compatible endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub embedding_model: String,
    pub llm_model: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub directories: Vec<String>,
    pub reload_interval_secs: u64,
    pub index_name: String,
    pub cache_root: PathBuf,
    pub top_k: usize,
    /// Distance cutoff for retrieval; `0.0` disables filtering.
    pub relevance_threshold: f32,
    pub stability_window_secs: f64,
    pub api: ApiConfig,
    config_file: Option<PathBuf>,
}

/// Command-line values that take precedence over every other source.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub directories: Option<Vec<String>>,
    pub reload_interval: Option<u64>,
    pub index_name: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
}

/// What changed between two loaded configurations.
#[derive(Debug, Clone, Default)]
pub struct ConfigDiff {
    pub changed: Vec<&'static str>,
    /// Port changes cannot be applied to a running listener.
    pub requires_restart: bool,
    /// True when a previously configured directory is gone; removals force
    /// a full rebuild, additions flow through the incremental path.
    pub directories_removed: bool,
}

impl ConfigDiff {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileApiSection {
    base_url: Option<String>,
    api_key: Option<String>,
    embedding_model: Option<String>,
    llm_model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileServerSection {
    port: Option<u16>,
    directories: Option<Vec<String>>,
    reload_interval: Option<u64>,
    index_name: Option<String>,
    cache_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    api: FileApiSection,
    #[serde(default)]
    server: FileServerSection,
}

#[derive(Debug, Default)]
struct EnvVars {
    base_url: Option<String>,
    api_key: Option<String>,
    embedding_model: Option<String>,
    llm_model: Option<String>,
}

impl EnvVars {
    fn from_process() -> Self {
        Self {
            base_url: std::env::var("MARKDOWN_QA_API_BASE_URL").ok(),
            api_key: std::env::var("MARKDOWN_QA_API_KEY").ok(),
            embedding_model: std::env::var("MARKDOWN_QA_EMBEDDING_MODEL").ok(),
            llm_model: std::env::var("MARKDOWN_QA_LLM_MODEL").ok(),
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".markdown-qa")
}

fn read_file_config(path: &Path) -> AppResult<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)
            .map_err(|e| AppError::Config(format!("invalid YAML in {}: {e}", path.display()))),
        Some("toml") => toml::from_str(&raw)
            .map_err(|e| AppError::Config(format!("invalid TOML in {}: {e}", path.display()))),
        other => Err(AppError::Config(format!(
            "unsupported config format {:?} for {}",
            other,
            path.display()
        ))),
    }
}

/// Canonicalize configured roots so manifest keys stay stable across
/// differently spelled paths. Roots that do not resolve are kept verbatim;
/// the loader reports them at scan time.
fn normalize_directories(directories: Vec<String>) -> Vec<String> {
    directories
        .into_iter()
        .map(|dir| match dunce::canonicalize(&dir) {
            Ok(path) => path.to_string_lossy().to_string(),
            Err(_) => {
                warn!("could not canonicalize directory {}, keeping as-is", dir);
                dir
            }
        })
        .collect()
}

impl ServerConfig {
    /// Resolve configuration from all sources.
    pub fn load(overrides: &CliOverrides) -> AppResult<Self> {
        let config_file = Self::resolve_config_file(overrides);
        let file = match &config_file {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(file, EnvVars::from_process(), overrides, config_file)
    }

    fn resolve_config_file(overrides: &CliOverrides) -> Option<PathBuf> {
        if let Some(path) = &overrides.config_file {
            return Some(path.clone());
        }
        let dir = default_config_dir();
        let yaml = dir.join("config.yaml");
        if yaml.exists() {
            return Some(yaml);
        }
        let toml = dir.join("config.toml");
        if toml.exists() {
            return Some(toml);
        }
        None
    }

    fn from_sources(
        file: FileConfig,
        env: EnvVars,
        overrides: &CliOverrides,
        config_file: Option<PathBuf>,
    ) -> AppResult<Self> {
        let base_url = file
            .api
            .base_url
            .or(env.base_url)
            .ok_or_else(|| missing_api_config())?;
        let api_key = file
            .api
            .api_key
            .or(env.api_key)
            .ok_or_else(|| missing_api_config())?;
        let embedding_model = file
            .api
            .embedding_model
            .or(env.embedding_model)
            .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string());
        let llm_model = file
            .api
            .llm_model
            .or(env.llm_model)
            .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string());

        let directories = overrides
            .directories
            .clone()
            .or(file.server.directories)
            .unwrap_or_default();
        if directories.is_empty() {
            return Err(AppError::Config(
                "no directories configured: pass --directories or set server.directories"
                    .into(),
            ));
        }

        Ok(Self {
            port: overrides.port.or(file.server.port).unwrap_or(DEFAULT_PORT),
            directories: normalize_directories(directories),
            reload_interval_secs: overrides
                .reload_interval
                .or(file.server.reload_interval)
                .unwrap_or(DEFAULT_RELOAD_INTERVAL_SECS),
            index_name: overrides
                .index_name
                .clone()
                .or(file.server.index_name)
                .unwrap_or_else(|| DEFAULT_INDEX_NAME.to_string()),
            cache_root: overrides
                .cache_dir
                .clone()
                .or(file.server.cache_dir)
                .unwrap_or_else(crate::cache::CacheLayout::default_root),
            top_k: DEFAULT_TOP_K,
            relevance_threshold: 0.0,
            stability_window_secs: crate::manifest::DEFAULT_STABILITY_WINDOW_SECS,
            api: ApiConfig {
                base_url,
                api_key,
                embedding_model,
                llm_model,
            },
            config_file,
        })
    }

    pub fn config_file_path(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Compare against a freshly loaded configuration.
    pub fn diff(&self, newer: &ServerConfig) -> ConfigDiff {
        let mut diff = ConfigDiff::default();
        if self.port != newer.port {
            diff.changed.push("port");
            diff.requires_restart = true;
        }
        if self.directories != newer.directories {
            diff.changed.push("directories");
            diff.directories_removed = self
                .directories
                .iter()
                .any(|dir| !newer.directories.contains(dir));
        }
        if self.reload_interval_secs != newer.reload_interval_secs {
            diff.changed.push("reload_interval");
        }
        if self.index_name != newer.index_name {
            diff.changed.push("index_name");
        }
        if self.cache_root != newer.cache_root {
            diff.changed.push("cache_dir");
        }
        if self.api != newer.api {
            diff.changed.push("api");
        }
        diff
    }
}

fn missing_api_config() -> AppError {
    AppError::Config(
        "API configuration is missing. Set api.base_url and api.api_key in \
         ~/.markdown-qa/config.yaml (or config.toml), or the environment \
         variables MARKDOWN_QA_API_BASE_URL and MARKDOWN_QA_API_KEY"
            .into(),
    )
}
