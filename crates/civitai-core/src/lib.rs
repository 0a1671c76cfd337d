//! civitai-core - Headless library for downloading and cataloguing Civitai models.
//!
//! This crate resolves Civitai page URLs, downloads model files with resume
//! support, keeps a CSV ledger of completed downloads and can identify local
//! files by hash. It performs no terminal I/O besides `tracing` events; the
//! `civitai-cli` crate provides the command-line front end.
//!
//! # Example
//!
//! ```rust,ignore
//! use civitai_core::{DownloadOptions, HistoryStore, ModelDownloader, Settings};
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> civitai_core::Result<()> {
//!     let settings = Arc::new(Settings::load("config.json")?);
//!     let history = HistoryStore::new(settings.history_file());
//!     let downloader = ModelDownloader::from_settings(settings)?;
//!
//!     let record = downloader
//!         .download_model(
//!             "https://civitai.com/models/649516?modelVersionId=726676",
//!             None,
//!             DownloadOptions::default(),
//!             None,
//!         )
//!         .await?;
//!     history.append(&record)?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod civitai;
pub mod classifier;
pub mod config;
pub mod downloader;
pub mod error;
pub mod history;
pub mod network;
pub mod scanner;

// Re-export commonly used types
pub use batch::{BatchEvent, BatchItem, BatchRunner, BatchSummary, ItemOutcome};
pub use civitai::{parse_model_url, ApiClient, ModelRef, ModelVersion};
pub use classifier::{classify, ApiTypeHint, Classification, LoraSubcategory, ModelKind};
pub use config::{NetworkSettings, Settings};
pub use downloader::{DownloadOptions, DownloadPlan, ModelDownloader};
pub use error::{CivitaiError, Result};
pub use history::{DownloadRecord, HistoryStore, ListOptions};
pub use network::{DownloadEngine, DownloadPolicy, DownloadProgress, HttpClient, RetryConfig};
pub use scanner::convert::{import_scan_results, ImportSummary};
pub use scanner::{MetadataScanner, ScanEntry, ScanOptions};
