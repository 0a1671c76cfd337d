//! Model-type classification.
//!
//! Decides which local folder a model belongs in. The API-reported type wins
//! when it is one we recognise; otherwise the file's directory is inspected.
//! LoRAs are further bucketed by their tags. Both priority orders are data
//! (the `const` tables below), so re-ordering them never touches the logic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Local model category, which doubles as the download folder key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Checkpoint,
    Lora,
    Embedding,
    Unknown,
}

impl ModelKind {
    /// Kinds that have a download directory.
    pub const DOWNLOADABLE: [ModelKind; 3] =
        [ModelKind::Lora, ModelKind::Checkpoint, ModelKind::Embedding];

    /// Return the canonical lowercase string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Checkpoint => "checkpoint",
            ModelKind::Lora => "lora",
            ModelKind::Embedding => "embedding",
            ModelKind::Unknown => "unknown",
        }
    }

    /// Parse a value stored in the history ledger. Anything unrecognised is
    /// `Unknown`.
    pub fn from_ledger(s: &str) -> Self {
        Self::parse_config_key(s).unwrap_or(ModelKind::Unknown)
    }

    /// Parse a `download_paths` key; accepts the plural folder spellings.
    pub fn parse_config_key(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "lora" | "loras" => Some(ModelKind::Lora),
            "checkpoint" | "checkpoints" => Some(ModelKind::Checkpoint),
            "embedding" | "embeddings" => Some(ModelKind::Embedding),
            _ => None,
        }
    }

    /// Validate a user-supplied `--type` value.
    pub fn parse_user_type(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "lora" => Some(ModelKind::Lora),
            "checkpoint" => Some(ModelKind::Checkpoint),
            "embedding" => Some(ModelKind::Embedding),
            _ => None,
        }
    }

    /// Listing order used by `sort_by_type`.
    pub fn sort_priority(&self) -> u32 {
        match self {
            ModelKind::Checkpoint => 0,
            ModelKind::Lora => 1,
            ModelKind::Embedding => 2,
            ModelKind::Unknown => 999,
        }
    }
}

impl Default for ModelKind {
    fn default() -> Self {
        ModelKind::Unknown
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thematic bucket for LoRA models, derived from tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoraSubcategory {
    Style,
    Poses,
    Concept,
    Character,
    Clothing,
    Background,
    Objects,
    Other,
}

impl LoraSubcategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoraSubcategory::Style => "style",
            LoraSubcategory::Poses => "poses",
            LoraSubcategory::Concept => "concept",
            LoraSubcategory::Character => "character",
            LoraSubcategory::Clothing => "clothing",
            LoraSubcategory::Background => "background",
            LoraSubcategory::Objects => "objects",
            LoraSubcategory::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        SUBCATEGORY_PRIORITY
            .iter()
            .copied()
            .chain(std::iter::once(LoraSubcategory::Other))
            .find(|c| c.as_str() == s)
    }
}

impl fmt::Display for LoraSubcategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// API type → local kind, checked in order.
const API_TYPE_TABLE: &[(&str, ModelKind)] = &[
    ("LORA", ModelKind::Lora),
    ("LOCON", ModelKind::Lora),
    ("DORA", ModelKind::Lora),
    ("CHECKPOINT", ModelKind::Checkpoint),
    ("TEXTUALINVERSION", ModelKind::Embedding),
];

/// Folder marker → local kind, checked in order.
const PATH_MARKER_TABLE: &[(&str, ModelKind)] = &[
    ("/loras/", ModelKind::Lora),
    ("/checkpoints/", ModelKind::Checkpoint),
    ("/embeddings/", ModelKind::Embedding),
];

/// First listed subcategory present in the tags wins.
const SUBCATEGORY_PRIORITY: &[LoraSubcategory] = &[
    LoraSubcategory::Style,
    LoraSubcategory::Poses,
    LoraSubcategory::Concept,
    LoraSubcategory::Character,
    LoraSubcategory::Clothing,
    LoraSubcategory::Background,
    LoraSubcategory::Objects,
];

/// API-side inputs to classification.
#[derive(Debug, Clone, Copy)]
pub struct ApiTypeHint<'a> {
    /// Raw `model.type` as reported by Civitai.
    pub api_type: &'a str,
    pub tags: &'a [String],
}

/// Result of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub model_type: ModelKind,
    pub api_model_type: Option<String>,
    pub lora_subcategory: Option<LoraSubcategory>,
}

/// Classify a model from API metadata and/or its location on disk.
pub fn classify(api: Option<ApiTypeHint<'_>>, path: Option<&Path>) -> Classification {
    let api_model_type = api
        .map(|hint| hint.api_type.trim().to_uppercase())
        .filter(|t| !t.is_empty());

    let model_type = api_model_type
        .as_deref()
        .and_then(kind_from_api_type)
        .or_else(|| path.and_then(kind_from_path))
        .unwrap_or(ModelKind::Unknown);

    let lora_subcategory = (model_type == ModelKind::Lora)
        .then(|| lora_subcategory(api.map(|h| h.tags).unwrap_or_default()));

    Classification {
        model_type,
        api_model_type,
        lora_subcategory,
    }
}

/// Map an API type string to a local kind.
pub fn kind_from_api_type(api_type: &str) -> Option<ModelKind> {
    let upper = api_type.trim().to_uppercase();
    API_TYPE_TABLE
        .iter()
        .find(|(name, _)| *name == upper)
        .map(|(_, kind)| *kind)
}

/// Infer a kind from well-known folder names in a path.
pub fn kind_from_path(path: &Path) -> Option<ModelKind> {
    let normalized = path.to_string_lossy().replace('\\', "/").to_lowercase();
    PATH_MARKER_TABLE
        .iter()
        .find(|(marker, _)| normalized.contains(marker))
        .map(|(_, kind)| *kind)
}

/// Pick the LoRA subcategory for a tag list.
pub fn lora_subcategory(tags: &[String]) -> LoraSubcategory {
    let tags: Vec<String> = tags.iter().map(|t| t.trim().to_lowercase()).collect();
    SUBCATEGORY_PRIORITY
        .iter()
        .copied()
        .find(|c| tags.iter().any(|t| t == c.as_str()))
        .unwrap_or(LoraSubcategory::Other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_locon_without_path_is_lora() {
        let tags = tags(&[]);
        let result = classify(
            Some(ApiTypeHint {
                api_type: "LOCON",
                tags: &tags,
            }),
            None,
        );
        assert_eq!(result.model_type, ModelKind::Lora);
        assert_eq!(result.api_model_type.as_deref(), Some("LOCON"));
        assert_eq!(result.lora_subcategory, Some(LoraSubcategory::Other));
    }

    #[test]
    fn test_api_types_are_case_insensitive() {
        assert_eq!(kind_from_api_type("LoCon"), Some(ModelKind::Lora));
        assert_eq!(kind_from_api_type("Checkpoint"), Some(ModelKind::Checkpoint));
        assert_eq!(
            kind_from_api_type("TextualInversion"),
            Some(ModelKind::Embedding)
        );
        assert_eq!(kind_from_api_type("Hypernetwork"), None);
    }

    #[test]
    fn test_path_fallback() {
        let path = PathBuf::from("/data/models/checkpoints/sdxl.safetensors");
        let result = classify(None, Some(&path));
        assert_eq!(result.model_type, ModelKind::Checkpoint);
        assert_eq!(result.api_model_type, None);
        assert_eq!(result.lora_subcategory, None);
    }

    #[test]
    fn test_path_windows_separators() {
        let path = PathBuf::from(r"C:\ComfyUI\models\Loras\thing.safetensors");
        assert_eq!(kind_from_path(&path), Some(ModelKind::Lora));
    }

    #[test]
    fn test_unknown_api_type_falls_back_to_path() {
        let tags = tags(&["style"]);
        let path = PathBuf::from("/m/embeddings/neg.pt");
        let result = classify(
            Some(ApiTypeHint {
                api_type: "Hypernetwork",
                tags: &tags,
            }),
            Some(&path),
        );
        assert_eq!(result.model_type, ModelKind::Embedding);
        assert_eq!(result.api_model_type.as_deref(), Some("HYPERNETWORK"));
        assert_eq!(result.lora_subcategory, None);
    }

    #[test]
    fn test_no_signal_is_unknown() {
        let path = PathBuf::from("/tmp/random/file.safetensors");
        assert_eq!(classify(None, Some(&path)).model_type, ModelKind::Unknown);
        assert_eq!(classify(None, None).model_type, ModelKind::Unknown);
    }

    #[test]
    fn test_subcategory_priority_beats_tag_order() {
        assert_eq!(
            lora_subcategory(&tags(&["character", "anime", "style"])),
            LoraSubcategory::Style
        );
        assert_eq!(
            lora_subcategory(&tags(&["Clothing", "Objects"])),
            LoraSubcategory::Clothing
        );
        assert_eq!(lora_subcategory(&tags(&["anime"])), LoraSubcategory::Other);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let tags = tags(&["poses", "concept"]);
        let hint = ApiTypeHint {
            api_type: "LORA",
            tags: &tags,
        };
        let first = classify(Some(hint), None);
        let second = classify(Some(hint), None);
        assert_eq!(first, second);
        assert_eq!(first.lora_subcategory, Some(LoraSubcategory::Poses));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(ModelKind::parse_user_type("LoRA"), Some(ModelKind::Lora));
        assert_eq!(ModelKind::parse_user_type("checkpoints"), None);
        assert_eq!(ModelKind::from_ledger("checkpoints"), ModelKind::Checkpoint);
        assert_eq!(ModelKind::from_ledger("vae"), ModelKind::Unknown);
        assert_eq!(LoraSubcategory::parse("Background"), Some(LoraSubcategory::Background));
        assert_eq!(LoraSubcategory::parse("other"), Some(LoraSubcategory::Other));
        assert_eq!(LoraSubcategory::parse("misc"), None);
    }
}
