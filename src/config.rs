use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use product_hub_core::firmware::TrackerLayout;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    pub wiki: WikiConfig,
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Blob root. Relative paths resolve against the working directory.
    pub root: PathBuf,
}

impl StorageConfig {
    pub fn resolved_root(&self) -> PathBuf {
        if self.root.is_absolute() {
            self.root.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&self.root))
                .unwrap_or_else(|_| self.root.clone())
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WikiConfig {
    pub base_url: String,
    pub user_email: String,
    pub root_page_id: String,
    #[serde(default = "default_wiki_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_wiki_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_wiki_batch_size")]
    pub batch_size: usize,
}

fn default_wiki_timeout_secs() -> u64 {
    60
}
fn default_wiki_max_retries() -> u32 {
    3
}
fn default_wiki_batch_size() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    pub base_url: String,
    pub project_path: String,
    pub project_id: String,
    /// Skip TLS verification for this client only.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Abort the sync when an issue cannot be fetched, instead of keeping
    /// the raw firmware value.
    #[serde(default)]
    pub strict: bool,
}

impl TrackerConfig {
    pub fn layout(&self) -> TrackerLayout {
        TrackerLayout::new(&self.base_url, &self.project_path, &self.project_id)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_resolve_concurrency")]
    pub resolve_concurrency: usize,
    #[serde(default = "default_materialize_timeout_secs")]
    pub materialize_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resolve_concurrency: default_resolve_concurrency(),
            materialize_timeout_secs: default_materialize_timeout_secs(),
        }
    }
}

fn default_resolve_concurrency() -> usize {
    16
}
fn default_materialize_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Public base URL, used when printing download links.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

fn default_public_url() -> String {
    "http://localhost:3080".to_string()
}

impl ServerConfig {
    pub fn download_url(&self, hash: &str) -> String {
        format!(
            "{}/api/attachments/download/{}",
            self.public_url.trim_end_matches('/'),
            hash
        )
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(config)
}

/// Normalize and check a parsed config.
pub fn validate(mut config: Config) -> Result<Config> {
    config.wiki.base_url = config.wiki.base_url.trim_end_matches('/').to_string();
    config.tracker.base_url = config.tracker.base_url.trim_end_matches('/').to_string();

    if config.wiki.base_url.is_empty() {
        anyhow::bail!("wiki.base_url must not be empty");
    }
    if config.wiki.root_page_id.trim().is_empty() {
        anyhow::bail!("wiki.root_page_id must not be empty");
    }
    if config.wiki.batch_size == 0 {
        anyhow::bail!("wiki.batch_size must be >= 1");
    }
    if config.wiki.timeout_secs == 0 {
        anyhow::bail!("wiki.timeout_secs must be >= 1");
    }
    if config.tracker.base_url.is_empty() {
        anyhow::bail!("tracker.base_url must not be empty");
    }
    if config.tracker.project_id.trim().is_empty() {
        anyhow::bail!("tracker.project_id must not be empty");
    }
    if config.sync.resolve_concurrency == 0 {
        anyhow::bail!("sync.resolve_concurrency must be >= 1");
    }
    if config.sync.materialize_timeout_secs == 0 {
        anyhow::bail!("sync.materialize_timeout_secs must be >= 1");
    }

    Ok(config)
}

/// Read a required secret from the environment.
pub fn secret_from_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} environment variable not set", name))
}
