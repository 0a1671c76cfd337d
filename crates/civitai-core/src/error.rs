//! Error types for civitai-core.
//!
//! Every failure the downloader, history ledger and scanner can report is a
//! variant of [`CivitaiError`]. HTTP outcomes are classified once (see
//! [`CivitaiError::from_status`]) so the API client and the download engine
//! agree on what is transient and what is permanent.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the civitai library.
#[derive(Debug, Error)]
pub enum CivitaiError {
    // Input errors
    #[error("Invalid Civitai URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // HTTP outcomes
    #[error("Unauthorized (401) for {url}")]
    Unauthorized { url: String },

    #[error("Forbidden (403) for {url}")]
    Forbidden { url: String },

    #[error("Not found (404): {url}")]
    NotFound { url: String },

    #[error("Rate limited for {url}, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        url: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Service unavailable (503) for {url}")]
    ServiceUnavailable { url: String },

    #[error("Unexpected HTTP status {status} for {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("Transfer too slow: {bytes_per_sec:.0} B/s below {threshold:.0} B/s for {stalled_for:?}")]
    LowSpeed {
        bytes_per_sec: f64,
        threshold: f64,
        stalled_for: Duration,
    },

    // Download bookkeeping
    #[error("File already exists: {0}")]
    DuplicateFile(PathBuf),

    #[error("Size mismatch for {path}: expected {expected} bytes, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    // Model resolution
    #[error("Model type mismatch: requested {requested}, Civitai reports {actual}")]
    TypeMismatch { requested: String, actual: String },

    #[error("Unsupported model type: {api_type}")]
    UnsupportedModelType { api_type: String },

    #[error("No downloadable model file in version {version_id}")]
    NoPrimaryFile { version_id: u64 },

    #[error("History index {index} out of range (1-{len})")]
    IndexOutOfRange { index: usize, len: usize },

    // Transport
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // File system
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("CSV error: {message}")]
    Csv {
        message: String,
        #[source]
        source: Option<csv::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for civitai operations.
pub type Result<T> = std::result::Result<T, CivitaiError>;

impl From<std::io::Error> for CivitaiError {
    fn from(err: std::io::Error) -> Self {
        CivitaiError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CivitaiError {
    fn from(err: serde_json::Error) -> Self {
        CivitaiError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<csv::Error> for CivitaiError {
    fn from(err: csv::Error) -> Self {
        CivitaiError::Csv {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CivitaiError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        CivitaiError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Classify a non-success HTTP status.
    ///
    /// Returns `None` for 2xx statuses.
    pub fn from_status(status: u16, url: &str, retry_after_secs: Option<u64>) -> Option<Self> {
        let url = url.to_string();
        match status {
            200..=299 => None,
            401 => Some(CivitaiError::Unauthorized { url }),
            403 => Some(CivitaiError::Forbidden { url }),
            404 => Some(CivitaiError::NotFound { url }),
            429 => Some(CivitaiError::RateLimited {
                url,
                retry_after_secs,
            }),
            503 => Some(CivitaiError::ServiceUnavailable { url }),
            status => Some(CivitaiError::UnexpectedStatus { url, status }),
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CivitaiError::RateLimited { .. }
                | CivitaiError::ServiceUnavailable { .. }
                | CivitaiError::LowSpeed { .. }
                | CivitaiError::Network { .. }
                | CivitaiError::Timeout(_)
        )
    }

    /// Server-supplied `Retry-After` hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CivitaiError::RateLimited {
                retry_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Short category label used in summaries.
    pub fn category(&self) -> &'static str {
        match self {
            CivitaiError::InvalidUrl { .. } => "InvalidURL",
            CivitaiError::Config { .. } => "Config",
            CivitaiError::Unauthorized { .. } => "Unauthorized",
            CivitaiError::Forbidden { .. } => "Forbidden",
            CivitaiError::NotFound { .. } => "NotFound",
            CivitaiError::RateLimited { .. } | CivitaiError::LowSpeed { .. } => "RateLimited",
            CivitaiError::ServiceUnavailable { .. } => "ServiceUnavailable",
            CivitaiError::UnexpectedStatus { .. } => "UnexpectedStatus",
            CivitaiError::DuplicateFile(_) => "Duplicate",
            CivitaiError::Integrity { .. } => "Integrity",
            CivitaiError::TypeMismatch { .. } | CivitaiError::UnsupportedModelType { .. } => {
                "ModelType"
            }
            CivitaiError::NoPrimaryFile { .. } => "NoFile",
            CivitaiError::IndexOutOfRange { .. } => "History",
            CivitaiError::Network { .. } | CivitaiError::Timeout(_) => "Network",
            CivitaiError::Io { .. } => "IO",
            CivitaiError::Json { .. } | CivitaiError::Csv { .. } => "Format",
            CivitaiError::Other(_) => "Error",
        }
    }

    /// One-line explanation suitable for the terminal.
    pub fn user_message(&self) -> String {
        match self {
            CivitaiError::Unauthorized { .. } => {
                "Unauthorized: the API key is missing or was rejected".to_string()
            }
            CivitaiError::Forbidden { .. } => {
                "Forbidden: this model may require purchase/Early Access".to_string()
            }
            CivitaiError::NotFound { .. } => {
                "NotFound: no such model, version or file on Civitai".to_string()
            }
            CivitaiError::RateLimited { .. } => {
                "RateLimited: Civitai is throttling requests, try again later".to_string()
            }
            CivitaiError::LowSpeed { .. } => {
                "RateLimited: transfer speed collapsed, likely server-side throttling".to_string()
            }
            CivitaiError::ServiceUnavailable { .. } => {
                "ServiceUnavailable: Civitai is temporarily unavailable".to_string()
            }
            CivitaiError::DuplicateFile(path) => format!(
                "Duplicate: {} already exists (use --force to overwrite)",
                path.display()
            ),
            other => format!("{}: {}", other.category(), other),
        }
    }
}
