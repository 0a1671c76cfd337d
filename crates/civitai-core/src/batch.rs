//! Sequential redownload of a work list.
//!
//! Each item is isolated: transient failures are retried with backoff, an
//! existing file counts as skipped and anything else is recorded as a
//! failure before moving on to the next item.

use crate::classifier::ModelKind;
use crate::downloader::{DownloadOptions, ModelDownloader};
use crate::error::CivitaiError;
use crate::history::DownloadRecord;
use crate::network::{retry_async_observed, DownloadProgress, RetryConfig};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One URL to (re)download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub url: String,
    pub model_type: Option<ModelKind>,
    /// Shown in progress output, usually the file name.
    pub label: String,
}

impl BatchItem {
    pub fn new(url: impl Into<String>, model_type: Option<ModelKind>) -> Self {
        let url = url.into();
        Self {
            label: url.clone(),
            url,
            model_type,
        }
    }

    /// Work item for a ledger row. Legacy `unknown` rows are re-classified.
    pub fn from_record(record: &DownloadRecord) -> Self {
        Self {
            url: record.url.clone(),
            model_type: Some(record.model_type).filter(|k| *k != ModelKind::Unknown),
            label: if record.filename.is_empty() {
                record.url.clone()
            } else {
                record.filename.clone()
            },
        }
    }
}

/// How one item ended.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Succeeded(Box<DownloadRecord>),
    Skipped { reason: String },
    Failed { category: &'static str, message: String },
}

/// Progress notifications for the caller.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    Started {
        index: usize,
        total: usize,
        item: BatchItem,
    },
    Retrying {
        index: usize,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        error: String,
    },
    Finished {
        index: usize,
        outcome: ItemOutcome,
    },
}

/// End-of-run counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Items that needed at least one retry.
    pub retried: usize,
}

impl BatchSummary {
    pub fn all_ok(&self) -> bool {
        self.failed == 0
    }
}

/// Runs a list of downloads one after another.
pub struct BatchRunner<'a> {
    downloader: &'a ModelDownloader,
    retry: RetryConfig,
}

impl<'a> BatchRunner<'a> {
    pub fn new(downloader: &'a ModelDownloader, retry: RetryConfig) -> Self {
        Self { downloader, retry }
    }

    /// Process `items` in order. Never stops early on an item failure.
    pub async fn run(
        &self,
        items: &[BatchItem],
        force: bool,
        events: Option<mpsc::UnboundedSender<BatchEvent>>,
        progress: Option<mpsc::Sender<DownloadProgress>>,
    ) -> BatchSummary {
        let emit = |event: BatchEvent| {
            if let Some(tx) = &events {
                let _ = tx.send(event);
            }
        };

        let total = items.len();
        let mut summary = BatchSummary {
            total,
            ..Default::default()
        };
        let options = DownloadOptions {
            force,
            resume: true,
        };

        for (i, item) in items.iter().enumerate() {
            let index = i + 1;
            info!("[{}/{}] {}", index, total, item.label);
            emit(BatchEvent::Started {
                index,
                total,
                item: item.clone(),
            });

            let (result, stats) = retry_async_observed(
                &self.retry,
                || {
                    self.downloader
                        .download_model(&item.url, item.model_type, options, progress.clone())
                },
                |e: &CivitaiError| e.is_retryable(),
                |e: &CivitaiError| e.retry_after(),
                |notice| {
                    emit(BatchEvent::Retrying {
                        index,
                        attempt: notice.attempt,
                        max_attempts: notice.max_attempts,
                        delay: notice.delay,
                        error: notice.error.clone(),
                    })
                },
            )
            .await;

            if stats.retries() > 0 {
                summary.retried += 1;
            }

            let outcome = match result {
                Ok(record) => {
                    summary.succeeded += 1;
                    ItemOutcome::Succeeded(Box::new(record))
                }
                Err(CivitaiError::DuplicateFile(path)) => {
                    summary.skipped += 1;
                    info!("Skipping {}: {} already exists", item.label, path.display());
                    ItemOutcome::Skipped {
                        reason: format!("{} already exists", path.display()),
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!("Failed {}: {}", item.label, e);
                    ItemOutcome::Failed {
                        category: e.category(),
                        message: e.user_message(),
                    }
                }
            };
            emit(BatchEvent::Finished { index, outcome });
        }

        info!(
            "Batch finished: {} succeeded, {} skipped, {} failed of {}",
            summary.succeeded, summary.skipped, summary.failed, summary.total
        );
        summary
    }
}
