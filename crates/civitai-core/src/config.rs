//! Centralized configuration for civitai-core.
//!
//! Compile-time defaults live on the unit structs below. The user's
//! `config.json` is loaded into [`Settings`], whose optional `network`
//! section overrides the network defaults for one run.

use crate::classifier::ModelKind;
use crate::error::{CivitaiError, Result};
use crate::network::{DownloadPolicy, LowSpeedPolicy, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const USER_AGENT: &'static str = concat!("civitai-dl/", env!("CARGO_PKG_VERSION"));
    pub const DEFAULT_CONFIG_FILE: &'static str = "config.json";
    pub const API_KEY_PLACEHOLDER: &'static str = "your_civitai_api_key_here";
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const API_BASE: &'static str = "https://civitai.com/api/v1";
    pub const DOWNLOAD_BASE: &'static str = "https://civitai.com/api/download/models";
    pub const WEB_BASE: &'static str = "https://civitai.com";
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(300);
    pub const DOWNLOAD_CHUNK_SIZE: usize = 4 * 1024 * 1024;
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    pub const LOW_SPEED_THRESHOLD_BYTES: u64 = 10 * 1024;
    pub const LOW_SPEED_DURATION: Duration = Duration::from_secs(30);
    pub const LOG_BODY_EXCERPT: usize = 512;
}

/// History ledger defaults.
pub struct HistoryConfig;

impl HistoryConfig {
    pub const DEFAULT_FILE: &'static str = "./download_history.csv";
    pub const BACKUP_SUFFIX: &'static str = ".backup";
    pub const TIMESTAMP_FORMAT: &'static str = "%Y-%m-%d %H:%M:%S";
}

/// Metadata scanner defaults.
pub struct ScanConfig;

impl ScanConfig {
    pub const CONCURRENCY: usize = 5;
    pub const HASH_CHUNK_SIZE: usize = 8 * 1024 * 1024;
    pub const MODEL_EXTENSIONS: &'static [&'static str] =
        &["safetensors", "ckpt", "pt", "pth", "bin"];
    pub const DEFAULT_OUTPUT: &'static str = "model_metadata_results.json";
}

/// Optional `network` section of `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkSettings {
    pub chunk_size: Option<usize>,
    pub progress_interval_ms: Option<u64>,
    pub low_speed_threshold_bytes: Option<u64>,
    pub low_speed_duration_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_secs: Option<u64>,
    pub scan_concurrency: Option<usize>,
}

/// The on-disk shape of `config.json`.
#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default)]
    civitai_api_key: Option<String>,
    #[serde(default)]
    download_paths: Option<BTreeMap<String, PathBuf>>,
    #[serde(default)]
    download_history_file: Option<PathBuf>,
    #[serde(default)]
    network: NetworkSettings,
}

/// Validated settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    api_key: String,
    download_paths: BTreeMap<ModelKind, PathBuf>,
    history_file: PathBuf,
    network: NetworkSettings,
}

impl Settings {
    /// Load and validate `config.json`.
    ///
    /// Relative paths inside the file are resolved against the file's
    /// directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CivitaiError::Config {
                message: format!(
                    "config file not found: {} (copy config.json.example and fill in your API key)",
                    path.display()
                ),
            });
        }

        let contents =
            std::fs::read_to_string(path).map_err(|e| CivitaiError::io_with_path(e, path))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        debug!("Loading configuration from {}", path.display());
        Self::from_json_str(&contents, &base_dir)
    }

    /// Parse and validate a configuration document.
    pub fn from_json_str(contents: &str, base_dir: &Path) -> Result<Self> {
        let raw: RawSettings = serde_json::from_str(contents).map_err(|e| CivitaiError::Config {
            message: format!("malformed config file: {}", e),
        })?;

        let api_key = raw
            .civitai_api_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty() && k != AppConfig::API_KEY_PLACEHOLDER)
            .ok_or_else(|| CivitaiError::Config {
                message: "civitai_api_key is not set (Civitai > Account Settings > API Keys)"
                    .to_string(),
            })?;

        let raw_paths = raw.download_paths.ok_or_else(|| CivitaiError::Config {
            message: "download_paths is missing".to_string(),
        })?;

        let mut download_paths = BTreeMap::new();
        for (key, dir) in raw_paths {
            match ModelKind::parse_config_key(&key) {
                Some(kind) => {
                    download_paths.insert(kind, resolve(base_dir, &dir));
                }
                None => debug!("Ignoring unknown download_paths key '{}'", key),
            }
        }
        for kind in ModelKind::DOWNLOADABLE {
            if !download_paths.contains_key(&kind) {
                return Err(CivitaiError::Config {
                    message: format!("download_paths.{} is missing", kind),
                });
            }
        }

        let history_file = raw
            .download_history_file
            .unwrap_or_else(|| PathBuf::from(HistoryConfig::DEFAULT_FILE));

        Ok(Self {
            api_key,
            download_paths,
            history_file: resolve(base_dir, &history_file),
            network: raw.network,
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn history_file(&self) -> &Path {
        &self.history_file
    }

    pub fn network(&self) -> &NetworkSettings {
        &self.network
    }

    /// Destination directory for a model kind.
    pub fn download_dir(&self, kind: ModelKind) -> Result<&Path> {
        self.download_paths
            .get(&kind)
            .map(PathBuf::as_path)
            .ok_or_else(|| CivitaiError::Config {
                message: format!("no download path configured for model type '{}'", kind),
            })
    }

    /// All configured download directories, in kind order.
    pub fn download_dirs(&self) -> impl Iterator<Item = (ModelKind, &Path)> {
        self.download_paths.iter().map(|(k, p)| (*k, p.as_path()))
    }

    /// Engine policy with config overrides applied.
    pub fn download_policy(&self) -> DownloadPolicy {
        let defaults = DownloadPolicy::default();
        let n = &self.network;
        DownloadPolicy {
            chunk_size: n.chunk_size.unwrap_or(defaults.chunk_size),
            progress_interval: n
                .progress_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.progress_interval),
            low_speed: Some(LowSpeedPolicy {
                min_bytes_per_sec: n
                    .low_speed_threshold_bytes
                    .unwrap_or(NetworkConfig::LOW_SPEED_THRESHOLD_BYTES)
                    as f64,
                grace: n
                    .low_speed_duration_secs
                    .map(Duration::from_secs)
                    .unwrap_or(NetworkConfig::LOW_SPEED_DURATION),
            }),
            ..defaults
        }
    }

    /// Retry policy for batch work and scanner lookups.
    pub fn retry_config(&self) -> RetryConfig {
        let n = &self.network;
        RetryConfig::new()
            .with_max_attempts(n.max_retries.unwrap_or(NetworkConfig::MAX_RETRIES))
            .with_base_delay(
                n.retry_base_delay_secs
                    .map(Duration::from_secs)
                    .unwrap_or(NetworkConfig::RETRY_BASE_DELAY),
            )
    }

    pub fn request_timeout(&self) -> Duration {
        self.network
            .request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(NetworkConfig::REQUEST_TIMEOUT)
    }

    pub fn scan_concurrency(&self) -> usize {
        self.network
            .scan_concurrency
            .unwrap_or(ScanConfig::CONCURRENCY)
            .max(1)
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
