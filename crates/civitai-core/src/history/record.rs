//! One row of the download ledger.

use crate::classifier::{Classification, LoraSubcategory, ModelKind};
use crate::config::HistoryConfig;
use chrono::NaiveDateTime;
use csv::StringRecord;
use serde::{Deserialize, Serialize};

/// Current ledger columns, in file order.
pub const HEADER: [&str; 10] = [
    "timestamp",
    "model_type",
    "api_model_type",
    "lora_subcategory",
    "url",
    "filename",
    "model_id",
    "version_id",
    "file_size",
    "file_size_bytes",
];

/// A completed download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub timestamp: String,
    pub model_type: ModelKind,
    pub api_model_type: Option<String>,
    pub lora_subcategory: Option<LoraSubcategory>,
    pub url: String,
    pub filename: String,
    pub model_id: Option<u64>,
    pub version_id: Option<u64>,
    /// Human-readable size, e.g. `"144.11 MB"`.
    pub file_size: String,
    pub file_size_bytes: Option<u64>,
}

/// Identity used when collapsing duplicate rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Model { model_id: u64, version_id: u64 },
    Url(String),
}

impl DownloadRecord {
    /// A record stamped with the current local time.
    pub fn new(url: impl Into<String>, model_type: ModelKind, filename: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Local::now()
                .format(HistoryConfig::TIMESTAMP_FORMAT)
                .to_string(),
            model_type,
            api_model_type: None,
            lora_subcategory: None,
            url: url.into(),
            filename: filename.into(),
            model_id: None,
            version_id: None,
            file_size: "Unknown".to_string(),
            file_size_bytes: None,
        }
    }

    pub fn with_ids(mut self, model_id: Option<u64>, version_id: Option<u64>) -> Self {
        self.model_id = model_id;
        self.version_id = version_id;
        self
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        self.file_size = format_file_size(bytes);
        self.file_size_bytes = Some(bytes);
        self
    }

    pub fn with_classification(mut self, classification: &Classification) -> Self {
        self.api_model_type = classification.api_model_type.clone();
        self.lora_subcategory = classification.lora_subcategory;
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// `(model_id, version_id)` when both are known, otherwise the URL.
    pub fn key(&self) -> Option<RecordKey> {
        match (self.model_id, self.version_id) {
            (Some(model_id), Some(version_id)) => Some(RecordKey::Model {
                model_id,
                version_id,
            }),
            _ if !self.url.is_empty() => Some(RecordKey::Url(self.url.clone())),
            _ => None,
        }
    }

    /// Ordering key for "most recent": parsed time first, raw text second.
    pub fn recency(&self) -> (Option<NaiveDateTime>, &str) {
        let parsed =
            NaiveDateTime::parse_from_str(self.timestamp.trim(), HistoryConfig::TIMESTAMP_FORMAT)
                .ok();
        (parsed, self.timestamp.as_str())
    }

    pub fn to_row(&self) -> [String; 10] {
        [
            self.timestamp.clone(),
            self.model_type.as_str().to_string(),
            self.api_model_type.clone().unwrap_or_default(),
            self.lora_subcategory
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            self.url.clone(),
            self.filename.clone(),
            opt_to_string(self.model_id),
            opt_to_string(self.version_id),
            self.file_size.clone(),
            opt_to_string(self.file_size_bytes),
        ]
    }

    /// Build a record from a row, looking columns up by header name so
    /// older schemas read with their missing columns left empty.
    pub fn from_row(headers: &StringRecord, row: &StringRecord) -> Self {
        let field = |name| column(headers, row, name);

        Self {
            timestamp: field("timestamp").to_string(),
            model_type: ModelKind::from_ledger(field("model_type")),
            api_model_type: non_empty(field("api_model_type")),
            lora_subcategory: LoraSubcategory::parse(field("lora_subcategory")),
            url: field("url").to_string(),
            filename: field("filename").to_string(),
            model_id: parse_id(field("model_id")),
            version_id: parse_id(field("version_id")),
            file_size: field("file_size").to_string(),
            file_size_bytes: field("file_size_bytes").parse().ok(),
        }
    }
}

/// Format a byte count with two decimals, e.g. `1.23 GB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{:.2} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.2} PB", size)
}

fn column<'a>(headers: &StringRecord, row: &'a StringRecord, name: &str) -> &'a str {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .and_then(|i| row.get(i))
        .map(str::trim)
        .unwrap_or("")
}

fn opt_to_string(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn parse_id(s: &str) -> Option<u64> {
    s.parse::<u64>().ok().filter(|id| *id > 0)
}
