//! Civitai REST API client.

use crate::civitai::model_ref::ModelRef;
use crate::civitai::types::{ModelDetails, ModelVersion};
use crate::config::NetworkConfig;
use crate::error::{CivitaiError, Result};
use crate::network::HttpClient;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Thin typed layer over the three metadata endpoints.
#[derive(Clone)]
pub struct ApiClient {
    http: Arc<HttpClient>,
    base_url: String,
}

impl ApiClient {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self::with_base_url(http, NetworkConfig::API_BASE)
    }

    /// Point the client at another API root (e.g. a local test server).
    pub fn with_base_url(http: Arc<HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /model-versions/by-hash/{sha256}`
    pub async fn by_hash(&self, sha256: &str) -> Result<Value> {
        let url = format!("{}/model-versions/by-hash/{}", self.base_url, sha256);
        self.http.get_json(&url).await
    }

    /// `GET /models/{id}`
    pub async fn model(&self, model_id: u64) -> Result<Value> {
        let url = format!("{}/models/{}", self.base_url, model_id);
        self.http.get_json(&url).await
    }

    /// `GET /model-versions/{id}`
    pub async fn model_version(&self, version_id: u64) -> Result<Value> {
        let url = format!("{}/model-versions/{}", self.base_url, version_id);
        self.http.get_json(&url).await
    }

    /// Fetch the version a page URL points at, or the newest version when
    /// the URL names none, enriched with model-level metadata.
    pub async fn resolve_version(&self, model: ModelRef) -> Result<ModelVersion> {
        match model.version_id {
            Some(version_id) => {
                let mut version: ModelVersion =
                    serde_json::from_value(self.model_version(version_id).await?)?;
                if let Some(owner) = version.model_id {
                    if owner != model.model_id {
                        warn!(
                            "Version {} belongs to model {}, not {}",
                            version_id, owner, model.model_id
                        );
                    }
                }
                let owner = version.model_id.unwrap_or(model.model_id);
                self.enrich(&mut version, owner).await;
                Ok(version)
            }
            None => {
                let details: ModelDetails = serde_json::from_value(self.model(model.model_id).await?)?;
                let mut version = details.model_versions.first().cloned().ok_or_else(|| {
                    CivitaiError::NotFound {
                        url: format!("{} (no versions)", model.canonical_url()),
                    }
                })?;
                debug!(
                    "No version in URL, using newest version {} of model {}",
                    version.id, model.model_id
                );
                version.enrich(&details);
                Ok(version)
            }
        }
    }

    /// Identify a local file by its SHA-256.
    pub async fn lookup_by_hash(&self, sha256: &str) -> Result<ModelVersion> {
        let mut version: ModelVersion = serde_json::from_value(self.by_hash(sha256).await?)?;
        if let Some(model_id) = version.model_id {
            self.enrich(&mut version, model_id).await;
        }
        Ok(version)
    }

    /// Best effort: failures are logged and the version is left as is.
    async fn enrich(&self, version: &mut ModelVersion, model_id: u64) {
        let details = match self.model(model_id).await {
            Ok(value) => serde_json::from_value::<ModelDetails>(value).map_err(CivitaiError::from),
            Err(e) => Err(e),
        };
        match details {
            Ok(details) => version.enrich(&details),
            Err(e) => warn!("Could not load details for model {}: {}", model_id, e),
        }
    }
}
