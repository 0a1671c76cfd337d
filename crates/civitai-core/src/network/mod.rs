//! Network utilities for HTTP operations, retries, and downloads.
//!
//! This module provides:
//! - HTTP client with bearer auth and status classification
//! - Retry logic with exponential backoff, jitter and `Retry-After` hints
//! - Resumable download engine with progress and low-speed detection

mod client;
mod download;
mod partial;
mod retry;
mod throughput;

pub use client::HttpClient;
pub use download::{
    DownloadEngine, DownloadOutcome, DownloadPolicy, DownloadProgress, DownloadRequest,
};
pub use partial::{PartialFile, TransferState};
pub use retry::{retry_async, retry_async_observed, RetryConfig, RetryNotice, RetryStats};
pub use throughput::{LowSpeedDetector, LowSpeedPolicy, Sample, ThroughputSampler};
