//! Configuration file parser for ~/.config/feedsync/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as a warning, since they are
//! usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Which storage backend holds the library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Object,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Object => "object",
        })
    }
}

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,

    /// SQLite database file. Defaults to `feedsync.db` in the config directory.
    pub database_path: Option<PathBuf>,

    /// Object store snapshot. Defaults to `feedsync.json` in the config directory.
    pub object_store_path: Option<PathBuf>,

    /// Rows fetched per page by lazy collections.
    pub page_size: usize,

    /// Pages each lazy collection keeps cached.
    pub page_cache_pages: usize,

    /// Articles upserted concurrently while applying one feed document.
    pub upsert_concurrency: usize,

    /// Feeds updated concurrently during a refresh round.
    pub refresh_concurrency: usize,

    pub request_timeout_secs: u64,

    /// Largest accepted response body, in bytes.
    pub max_feed_bytes: usize,

    pub user_agent: String,

    /// Accept feed URLs on localhost and private networks.
    pub allow_private_hosts: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            database_path: None,
            object_store_path: None,
            page_size: crate::storage::DEFAULT_PAGE_SIZE,
            page_cache_pages: crate::storage::DEFAULT_CACHED_PAGES,
            upsert_concurrency: crate::storage::DEFAULT_UPSERT_CONCURRENCY,
            refresh_concurrency: crate::feed::DEFAULT_REFRESH_CONCURRENCY,
            request_timeout_secs: crate::feed::DEFAULT_TIMEOUT.as_secs(),
            max_feed_bytes: crate::feed::DEFAULT_MAX_BYTES,
            user_agent: concat!("feedsync/", env!("CARGO_PKG_VERSION")).to_string(),
            allow_private_hosts: false,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 11] = [
        "backend",
        "database_path",
        "object_store_path",
        "page_size",
        "page_cache_pages",
        "upsert_concurrency",
        "refresh_concurrency",
        "request_timeout_secs",
        "max_feed_bytes",
        "user_agent",
        "allow_private_hosts",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), backend = %config.backend, "Loaded configuration");
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Where the given backend keeps its data, relative to `config_dir` unless
    /// configured explicitly.
    pub fn store_path(&self, backend: BackendKind, config_dir: &Path) -> PathBuf {
        match backend {
            BackendKind::Sqlite => self
                .database_path
                .clone()
                .unwrap_or_else(|| config_dir.join("feedsync.db")),
            BackendKind::Object => self
                .object_store_path
                .clone()
                .unwrap_or_else(|| config_dir.join("feedsync.json")),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
