//! Identify local model files through the Civitai by-hash endpoint.
//!
//! Files are discovered by extension, hashed on the blocking pool and looked
//! up with a bounded number of requests in flight. Results keep discovery
//! order and can be written to JSON, then imported into the history ledger
//! with [`convert::import_scan_results`].

pub mod convert;
mod hashing;

pub use hashing::{compute_sha256, compute_sha256_async};

use crate::civitai::{ApiClient, ModelVersion};
use crate::classifier::{classify, ApiTypeHint, LoraSubcategory, ModelKind};
use crate::config::ScanConfig;
use crate::error::{CivitaiError, Result};
use crate::network::{retry_async_observed, RetryConfig};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Scanner tunables.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Maximum lookups in flight.
    pub concurrency: usize,
    /// Retry policy for transient lookup failures.
    pub retry: RetryConfig,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            concurrency: ScanConfig::CONCURRENCY,
            retry: RetryConfig::default(),
        }
    }
}

/// One scanned file, as written to the results JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanEntry {
    pub file_name: String,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub model_id: Option<u64>,
    #[serde(default)]
    pub version_id: Option<u64>,
    #[serde(default)]
    pub model_type: ModelKind,
    #[serde(default)]
    pub api_model_type: Option<String>,
    #[serde(default)]
    pub lora_subcategory: Option<LoraSubcategory>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub civitai_url: Option<String>,
    #[serde(default)]
    pub download_urls: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub nsfw_level: u32,
    #[serde(default)]
    pub base_model: Option<String>,
}

impl ScanEntry {
    /// Build an entry from a file and, when Civitai knows it, its version.
    pub fn new(path: &Path, file_size: Option<u64>, sha256: Option<String>, version: Option<&ModelVersion>) -> Self {
        let hint = version.and_then(|v| {
            v.api_type().map(|api_type| ApiTypeHint {
                api_type,
                tags: v.tags(),
            })
        });
        let classification = classify(hint, Some(path));

        let mut entry = Self {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_path: Some(path.to_path_buf()),
            file_size,
            sha256,
            model_type: classification.model_type,
            api_model_type: classification.api_model_type,
            lora_subcategory: classification.lora_subcategory,
            ..Default::default()
        };

        if let Some(v) = version {
            entry.model_id = v.model_id;
            entry.version_id = Some(v.id);
            entry.model_name = v.model_name().map(str::to_string);
            entry.creator = v.creator_name().map(str::to_string);
            entry.civitai_url = v.model_ref().map(|r| r.canonical_url());
            entry.download_urls = v.download_urls();
            entry.tags = v.tags().to_vec();
            entry.nsfw_level = v.nsfw_level();
            entry.base_model = v.base_model.clone();
        }
        entry
    }

    /// Whether Civitai identified this file.
    pub fn is_identified(&self) -> bool {
        self.version_id.is_some()
    }
}

/// Hash-based metadata scanner.
pub struct MetadataScanner {
    api: ApiClient,
    options: ScanOptions,
}

impl MetadataScanner {
    pub fn new(api: ApiClient, options: ScanOptions) -> Self {
        Self { api, options }
    }

    /// Model files under `root`, sorted. A missing root yields nothing.
    pub fn discover(&self, root: &Path) -> Vec<PathBuf> {
        if !root.exists() {
            warn!("Scan directory does not exist: {}", root.display());
            return Vec::new();
        }

        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable entry during scan: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| is_model_file(path))
            .collect();
        files.sort();
        debug!("Discovered {} model files under {}", files.len(), root.display());
        files
    }

    /// Hash one file and look it up.
    ///
    /// An unknown hash still yields an entry classified from the path.
    /// Only an authentication failure is returned as an error (besides
    /// local I/O errors), since it would fail every other lookup too.
    pub async fn scan_file(&self, path: &Path) -> Result<ScanEntry> {
        let file_size = tokio::fs::metadata(path)
            .await
            .map_err(|e| CivitaiError::io_with_path(e, path))?
            .len();
        let sha256 = compute_sha256_async(path).await?;
        debug!("SHA256 {} = {}", path.display(), sha256);

        let (result, stats) = retry_async_observed(
            &self.options.retry,
            || self.api.lookup_by_hash(&sha256),
            |e: &CivitaiError| e.is_retryable(),
            |e: &CivitaiError| e.retry_after(),
            |_| {},
        )
        .await;

        let version = match result {
            Ok(version) => {
                info!(
                    "Identified {} as {} (model {:?}, version {})",
                    path.display(),
                    version.model_name().unwrap_or("Unknown"),
                    version.model_id,
                    version.id
                );
                Some(version)
            }
            Err(e @ CivitaiError::Unauthorized { .. }) => return Err(e),
            Err(CivitaiError::NotFound { .. }) => {
                info!("Not found on Civitai: {}", path.display());
                None
            }
            Err(e) => {
                warn!(
                    "Lookup failed for {} after {} attempts: {}",
                    path.display(),
                    stats.attempts,
                    e
                );
                None
            }
        };

        Ok(ScanEntry::new(path, Some(file_size), Some(sha256), version.as_ref()))
    }

    /// Scan every model file under `root`.
    pub async fn scan_directory(&self, root: &Path) -> Result<Vec<ScanEntry>> {
        let files = self.discover(root);
        info!("Scanning {} files in {}", files.len(), root.display());
        self.scan_files(files).await
    }

    /// Scan the given files, keeping their order.
    pub async fn scan_files(&self, files: Vec<PathBuf>) -> Result<Vec<ScanEntry>> {
        let total = files.len();
        let mut results = futures::stream::iter(files.into_iter().enumerate())
            .map(|(i, path)| async move {
                debug!("[{}/{}] {}", i + 1, total, path.display());
                let entry = self.scan_file(&path).await;
                (path, entry)
            })
            .buffered(self.options.concurrency.max(1));

        let mut entries = Vec::with_capacity(total);
        while let Some((path, entry)) = results.next().await {
            match entry {
                Ok(entry) => entries.push(entry),
                Err(e @ CivitaiError::Unauthorized { .. }) => return Err(e),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        Ok(entries)
    }
}

fn is_model_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ScanConfig::MODEL_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Write scan results as pretty JSON.
pub fn write_json(path: &Path, entries: &[ScanEntry]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| CivitaiError::io_with_path(e, parent))?;
    }
    let json = serde_json::to_string_pretty(entries)?;
    std::fs::write(path, json).map_err(|e| CivitaiError::io_with_path(e, path))?;
    info!("Saved {} scan results to {}", entries.len(), path.display());
    Ok(())
}

/// Read scan results. A single object is accepted as a one-entry list.
pub fn read_json(path: &Path) -> Result<Vec<ScanEntry>> {
    let contents = std::fs::read_to_string(path).map_err(|e| CivitaiError::io_with_path(e, path))?;
    let value: serde_json::Value = serde_json::from_str(&contents)?;
    let entries = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(entries)
}

/// Download URLs grouped by model type, deduplicated and sorted.
pub fn urls_by_type(entries: &[ScanEntry]) -> BTreeMap<ModelKind, Vec<String>> {
    let mut grouped: BTreeMap<ModelKind, Vec<String>> = BTreeMap::new();
    for entry in entries {
        grouped
            .entry(entry.model_type)
            .or_default()
            .extend(entry.download_urls.iter().cloned());
    }
    for urls in grouped.values_mut() {
        urls.sort();
        urls.dedup();
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::HttpClient;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn scanner() -> MetadataScanner {
        let http = Arc::new(HttpClient::new(None).unwrap());
        MetadataScanner::new(ApiClient::new(http), ScanOptions::default())
    }

    #[test]
    fn test_discover_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let loras = tmp.path().join("loras");
        std::fs::create_dir_all(loras.join("sub")).unwrap();
        std::fs::write(loras.join("b.safetensors"), b"b").unwrap();
        std::fs::write(loras.join("sub").join("a.CKPT"), b"a").unwrap();
        std::fs::write(loras.join("notes.txt"), b"x").unwrap();
        std::fs::write(loras.join("c.pt"), b"c").unwrap();

        let found = scanner().discover(tmp.path());
        let names: Vec<String> = found
            .iter()
            .map(|p| p.strip_prefix(tmp.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(
            names,
            vec!["loras/b.safetensors", "loras/c.pt", "loras/sub/a.CKPT"]
        );
    }

    #[test]
    fn test_discover_missing_root() {
        assert!(scanner()
            .discover(Path::new("/no/such/model/dir"))
            .is_empty());
    }

    #[test]
    fn test_entry_from_version() {
        let version: ModelVersion = serde_json::from_value(json!({
            "id": 20,
            "modelId": 10,
            "baseModel": "SD 1.5",
            "model": { "name": "Poser", "type": "LORA", "tags": ["poses"] },
            "files": [{ "name": "p.safetensors", "type": "Model", "primary": true,
                        "downloadUrl": "https://civitai.com/api/download/models/20" }]
        }))
        .unwrap();

        let path = Path::new("/models/checkpoints/p.safetensors");
        let entry = ScanEntry::new(path, Some(3), Some("aa".into()), Some(&version));
        // API type wins over the folder name
        assert_eq!(entry.model_type, ModelKind::Lora);
        assert_eq!(entry.lora_subcategory, Some(LoraSubcategory::Poses));
        assert_eq!(entry.model_id, Some(10));
        assert_eq!(entry.version_id, Some(20));
        assert_eq!(
            entry.civitai_url.as_deref(),
            Some("https://civitai.com/models/10?modelVersionId=20")
        );
        assert_eq!(entry.base_model.as_deref(), Some("SD 1.5"));
        assert!(entry.is_identified());
    }

    #[test]
    fn test_entry_without_version_uses_path() {
        let entry = ScanEntry::new(Path::new("/m/embeddings/neg.pt"), None, None, None);
        assert_eq!(entry.file_name, "neg.pt");
        assert_eq!(entry.model_type, ModelKind::Embedding);
        assert!(!entry.is_identified());
        assert!(entry.download_urls.is_empty());
    }

    #[test]
    fn test_json_round_trip_and_single_object() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("results.json");
        let entries = vec![ScanEntry::new(Path::new("/m/loras/x.safetensors"), Some(1), None, None)];
        write_json(&path, &entries).unwrap();
        assert_eq!(read_json(&path).unwrap(), entries);

        let single = tmp.path().join("single.json");
        std::fs::write(
            &single,
            r#"{"file_name": "a.safetensors", "model_id": 1, "version_id": 2, "model_type": "lora"}"#,
        )
        .unwrap();
        let read = read_json(&single).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].model_type, ModelKind::Lora);
        assert_eq!(read[0].nsfw_level, 0);
    }

    #[test]
    fn test_urls_by_type() {
        let mut a = ScanEntry::new(Path::new("/m/loras/a.safetensors"), None, None, None);
        a.download_urls = vec!["u2".into(), "u1".into()];
        let mut b = ScanEntry::new(Path::new("/m/loras/b.safetensors"), None, None, None);
        b.download_urls = vec!["u1".into()];
        let mut c = ScanEntry::new(Path::new("/m/checkpoints/c.safetensors"), None, None, None);
        c.download_urls = vec!["u3".into()];

        let grouped = urls_by_type(&[a, b, c]);
        assert_eq!(grouped[&ModelKind::Lora], vec!["u1", "u2"]);
        assert_eq!(grouped[&ModelKind::Checkpoint], vec!["u3"]);
        assert!(!grouped.contains_key(&ModelKind::Embedding));
    }
}
