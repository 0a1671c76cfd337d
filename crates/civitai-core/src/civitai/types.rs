//! Typed views of Civitai API responses.
//!
//! Only the fields the downloader and scanner read are modelled; everything
//! else in the payload is ignored. Every field is optional or defaulted since
//! the API omits keys freely.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use super::model_ref::ModelRef;

/// `GET /model-versions/{id}` and `GET /model-versions/by-hash/{sha256}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelVersion {
    pub id: u64,
    #[serde(default)]
    pub model_id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub nsfw_level: Option<u32>,
    #[serde(default)]
    pub files: Vec<VersionFile>,
    #[serde(default)]
    pub model: Option<ModelSummary>,
    /// Filled in from the model endpoint.
    #[serde(default)]
    pub creator: Option<Creator>,
}

/// The `model` object embedded in a version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSummary {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub model_type: Option<String>,
    #[serde(default)]
    pub nsfw: Option<bool>,
    #[serde(default, deserialize_with = "tag_names")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    #[serde(default)]
    pub username: Option<String>,
}

/// `GET /models/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDetails {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub model_type: Option<String>,
    #[serde(default)]
    pub nsfw: Option<bool>,
    #[serde(default, deserialize_with = "tag_names")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub creator: Option<Creator>,
    /// Newest first.
    #[serde(default)]
    pub model_versions: Vec<ModelVersion>,
}

/// One entry of a version's `files` array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionFile {
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    #[serde(default, rename = "sizeKB")]
    pub size_kb: Option<f64>,
    #[serde(default, rename = "type")]
    pub file_type: Option<String>,
    #[serde(default)]
    pub primary: Option<bool>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub mirrors: Vec<Mirror>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mirror {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl VersionFile {
    pub fn is_model(&self) -> bool {
        self.file_type.as_deref() == Some("Model")
    }

    pub fn is_primary(&self) -> bool {
        self.primary.unwrap_or(false)
    }

    /// Size reported by the API, converted from KiB.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size_kb
            .filter(|kb| *kb > 0.0)
            .map(|kb| (kb * 1024.0).round() as u64)
    }

    pub fn sha256(&self) -> Option<&str> {
        self.hashes
            .iter()
            .find(|(algo, _)| algo.eq_ignore_ascii_case("sha256"))
            .map(|(_, hash)| hash.as_str())
    }
}

impl ModelVersion {
    /// The file to download: the primary `Model` file, else the first
    /// `Model` file.
    pub fn primary_file(&self) -> Option<&VersionFile> {
        self.files
            .iter()
            .find(|f| f.is_model() && f.is_primary())
            .or_else(|| self.files.iter().find(|f| f.is_model()))
    }

    pub fn api_type(&self) -> Option<&str> {
        self.model.as_ref().and_then(|m| m.model_type.as_deref())
    }

    pub fn tags(&self) -> &[String] {
        self.model.as_ref().map(|m| m.tags.as_slice()).unwrap_or(&[])
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model.as_ref().and_then(|m| m.name.as_deref())
    }

    pub fn creator_name(&self) -> Option<&str> {
        self.creator.as_ref().and_then(|c| c.username.as_deref())
    }

    /// NSFW level, falling back to the model's boolean flag.
    pub fn nsfw_level(&self) -> u32 {
        self.nsfw_level.unwrap_or_else(|| {
            let nsfw = self.model.as_ref().and_then(|m| m.nsfw).unwrap_or(false);
            u32::from(nsfw)
        })
    }

    pub fn model_ref(&self) -> Option<ModelRef> {
        self.model_id.map(|mid| ModelRef::new(mid, Some(self.id)))
    }

    /// Download URLs of the primary model files plus their live mirrors,
    /// falling back to the version-level URL.
    pub fn download_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for file in self.files.iter().filter(|f| f.is_model() && f.is_primary()) {
            if let Some(url) = &file.download_url {
                push_unique(&mut urls, url);
            }
            for mirror in &file.mirrors {
                if let (Some(url), None) = (&mirror.url, &mirror.deleted_at) {
                    push_unique(&mut urls, url);
                }
            }
        }

        if urls.is_empty() {
            if let Some(url) = &self.download_url {
                push_unique(&mut urls, url);
            }
        }
        urls
    }

    /// Merge model-level fields (type, tags, creator) into this version.
    pub fn enrich(&mut self, details: &ModelDetails) {
        if self.model_id.is_none() {
            self.model_id = Some(details.id);
        }

        let summary = self.model.get_or_insert_with(ModelSummary::default);
        if summary.name.is_none() {
            summary.name = details.name.clone();
        }
        if summary.model_type.is_none() {
            summary.model_type = details.model_type.clone();
        }
        if summary.nsfw.is_none() {
            summary.nsfw = details.nsfw;
        }
        if summary.description.is_none() {
            summary.description = details.description.clone();
        }
        if !details.tags.is_empty() {
            summary.tags = details.tags.clone();
        }

        if details.creator.is_some() {
            self.creator = details.creator.clone();
        }
    }
}

fn push_unique(urls: &mut Vec<String>, url: &str) {
    if !url.is_empty() && !urls.iter().any(|u| u == url) {
        urls.push(url.to_string());
    }
}

/// Tags arrive either as plain strings or as `{ "name": ... }` objects.
fn tag_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Tag {
        Name(String),
        Object { name: String },
    }

    let tags: Option<Vec<Tag>> = Option::deserialize(deserializer)?;
    Ok(tags
        .unwrap_or_default()
        .into_iter()
        .map(|t| match t {
            Tag::Name(name) | Tag::Object { name } => name,
        })
        .collect())
}
