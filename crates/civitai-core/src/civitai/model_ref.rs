//! Civitai model page URLs.

use crate::config::NetworkConfig;
use crate::error::{CivitaiError, Result};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use url::Url;

static MODEL_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/models/(\d+)(?:/|$)").expect("model path regex must compile"));

/// Model and optional version addressed by a page URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub model_id: u64,
    pub version_id: Option<u64>,
}

impl ModelRef {
    pub fn new(model_id: u64, version_id: Option<u64>) -> Self {
        Self {
            model_id,
            version_id,
        }
    }

    /// `https://civitai.com/models/{id}[?modelVersionId={vid}]`
    pub fn canonical_url(&self) -> String {
        match self.version_id {
            Some(vid) => format!(
                "{}/models/{}?modelVersionId={}",
                NetworkConfig::WEB_BASE,
                self.model_id,
                vid
            ),
            None => format!("{}/models/{}", NetworkConfig::WEB_BASE, self.model_id),
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version_id {
            Some(vid) => write!(f, "model {} version {}", self.model_id, vid),
            None => write!(f, "model {}", self.model_id),
        }
    }
}

/// Extract the model ID and optional `modelVersionId` from a page URL.
///
/// Slugs and unrelated query parameters are ignored.
pub fn parse_model_url(input: &str) -> Result<ModelRef> {
    let trimmed = input.trim();
    let invalid = |reason: &str| CivitaiError::InvalidUrl {
        url: trimmed.to_string(),
        reason: reason.to_string(),
    };

    let parsed = Url::parse(trimmed)
        .or_else(|_| Url::parse(&format!("https://{}", trimmed)))
        .map_err(|e| invalid(&e.to_string()))?;

    let model_id = MODEL_PATH
        .captures(parsed.path())
        .and_then(|c| c.get(1))
        .ok_or_else(|| invalid("no models/{id} segment"))?
        .as_str()
        .parse::<u64>()
        .map_err(|_| invalid("model ID out of range"))?;

    let version_id = match parsed
        .query_pairs()
        .find(|(key, _)| key == "modelVersionId")
    {
        Some((_, value)) => match value.trim().parse::<u64>() {
            Ok(vid) if vid > 0 => Some(vid),
            _ => return Err(invalid("modelVersionId must be a positive integer")),
        },
        None => None,
    };

    Ok(ModelRef {
        model_id,
        version_id,
    })
}
