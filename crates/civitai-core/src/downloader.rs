//! Single-URL download orchestration.
//!
//! A page URL is resolved to a version, classified, mapped to a destination
//! under the configured download directories and handed to the
//! [`DownloadEngine`]. Recording the result in history is left to the caller.

use crate::civitai::{parse_model_url, ApiClient, ModelRef, ModelVersion};
use crate::classifier::{classify, lora_subcategory, ApiTypeHint, Classification, ModelKind};
use crate::config::{NetworkConfig, Settings};
use crate::error::{CivitaiError, Result};
use crate::history::DownloadRecord;
use crate::network::{DownloadEngine, DownloadProgress, DownloadRequest, HttpClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Characters that cannot appear in a file name on common filesystems.
const RESERVED_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Per-call switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Overwrite an existing file at the destination.
    pub force: bool,
    /// Continue from a matching `.part` file.
    pub resume: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            force: false,
            resume: true,
        }
    }
}

/// Everything decided before any bytes are transferred.
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    /// The URL as given by the user.
    pub source_url: String,
    pub model_ref: ModelRef,
    pub version: ModelVersion,
    pub model_type: ModelKind,
    pub classification: Classification,
    pub file_name: String,
    pub destination: PathBuf,
    pub download_url: String,
    pub expected_size: Option<u64>,
}

impl DownloadPlan {
    /// Version ID from the URL, or the one the API resolved.
    pub fn version_id(&self) -> u64 {
        self.model_ref.version_id.unwrap_or(self.version.id)
    }
}

/// Resolves, classifies and downloads models addressed by page URL.
pub struct ModelDownloader {
    settings: Arc<Settings>,
    api: ApiClient,
    engine: DownloadEngine,
}

impl ModelDownloader {
    pub fn new(settings: Arc<Settings>, api: ApiClient, engine: DownloadEngine) -> Self {
        Self {
            settings,
            api,
            engine,
        }
    }

    /// Build the client stack from settings.
    pub fn from_settings(settings: Arc<Settings>) -> Result<Self> {
        let http = Arc::new(HttpClient::with_timeout(
            Some(settings.api_key().to_string()),
            settings.request_timeout(),
        )?);
        let api = ApiClient::new(http.clone());
        let engine = DownloadEngine::new(http, settings.download_policy());
        Ok(Self::new(settings, api, engine))
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Resolve a URL into a [`DownloadPlan`] without downloading.
    pub async fn plan(&self, url: &str, requested_type: Option<ModelKind>) -> Result<DownloadPlan> {
        let model_ref = parse_model_url(url)?;
        info!("Resolving {}", model_ref);

        let version = self.api.resolve_version(model_ref).await?;
        let hint = version.api_type().map(|api_type| ApiTypeHint {
            api_type,
            tags: version.tags(),
        });
        let mut classification = classify(hint, None);
        let model_type = select_kind(&classification, requested_type)?;
        if model_type == ModelKind::Lora && classification.lora_subcategory.is_none() {
            classification.lora_subcategory = Some(lora_subcategory(version.tags()));
        }
        classification.model_type = model_type;

        let file = version
            .primary_file()
            .ok_or(CivitaiError::NoPrimaryFile {
                version_id: version.id,
            })?;
        let file_name = safe_file_name(&file.name, version.id);
        let expected_size = file.size_bytes();
        let destination = self.settings.download_dir(model_type)?.join(&file_name);
        let download_url = file
            .download_url
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("{}/{}", NetworkConfig::DOWNLOAD_BASE, version.id));

        debug!(
            "Planned {} as {} -> {}",
            model_ref,
            model_type,
            destination.display()
        );

        Ok(DownloadPlan {
            source_url: url.trim().to_string(),
            model_ref,
            version,
            model_type,
            classification,
            file_name,
            destination,
            download_url,
            expected_size,
        })
    }

    /// Download a planned model and build its history record.
    pub async fn execute(
        &self,
        plan: &DownloadPlan,
        options: DownloadOptions,
        progress: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<DownloadRecord> {
        let request = DownloadRequest::new(&plan.download_url, &plan.destination)
            .with_size_hint(plan.expected_size)
            .with_resume(options.resume)
            .with_force(options.force);
        let outcome = self.engine.download(&request, progress).await?;

        info!(
            "Saved {} ({} bytes, resumed from {})",
            outcome.path.display(),
            outcome.total_bytes,
            outcome.resumed_from
        );

        Ok(DownloadRecord::new(&plan.source_url, plan.model_type, &plan.file_name)
            .with_ids(Some(plan.model_ref.model_id), Some(plan.version_id()))
            .with_size(outcome.total_bytes)
            .with_classification(&plan.classification))
    }

    /// Parse, resolve, classify and download one model URL.
    pub async fn download_model(
        &self,
        url: &str,
        requested_type: Option<ModelKind>,
        options: DownloadOptions,
        progress: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<DownloadRecord> {
        let plan = self.plan(url, requested_type).await?;
        self.execute(&plan, options, progress).await
    }
}

/// Reconcile the classified kind with the one the user asked for.
fn select_kind(classification: &Classification, requested: Option<ModelKind>) -> Result<ModelKind> {
    match (requested, classification.model_type) {
        (Some(requested), ModelKind::Unknown) => Ok(requested),
        (Some(requested), actual) if requested != actual => Err(CivitaiError::TypeMismatch {
            requested: requested.to_string(),
            actual: classification
                .api_model_type
                .clone()
                .unwrap_or_else(|| actual.to_string()),
        }),
        (_, ModelKind::Unknown) => Err(CivitaiError::UnsupportedModelType {
            api_type: classification
                .api_model_type
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        }),
        (_, actual) => Ok(actual),
    }
}

/// Strip path components and reserved characters from a server-supplied name.
fn safe_file_name(name: &str, version_id: u64) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !RESERVED_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        format!("model_{}.safetensors", version_id)
    } else {
        cleaned
    }
}
