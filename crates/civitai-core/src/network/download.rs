//! Resumable file downloads with progress reporting.
//!
//! The engine performs a single attempt: it picks up an existing partial
//! when that is safe, streams the rest, and promotes the partial once the
//! byte count checks out. Retrying is left to the caller, which is why every
//! failure leaves the `.part` file in place.

use crate::config::NetworkConfig;
use crate::error::{CivitaiError, Result};
use crate::network::client::HttpClient;
use crate::network::partial::{file_len, PartialFile};
use crate::network::throughput::{LowSpeedDetector, LowSpeedPolicy, ThroughputSampler};
use futures::StreamExt;
use reqwest::{header, Response, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Progress information for a download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Bytes on disk so far, including any resumed prefix.
    pub bytes_downloaded: u64,
    /// Total bytes (if known).
    pub total_bytes: Option<u64>,
    /// Download speed in bytes per second.
    pub speed_bytes_per_sec: f64,
    /// Percentage complete (0-100).
    pub percent: Option<f64>,
    /// Estimated time remaining in seconds.
    pub eta_seconds: Option<f64>,
}

impl DownloadProgress {
    pub fn new(bytes_downloaded: u64, total_bytes: Option<u64>, speed: f64) -> Self {
        let percent = total_bytes.map(|total| {
            if total > 0 {
                (bytes_downloaded as f64 / total as f64) * 100.0
            } else {
                0.0
            }
        });

        let eta_seconds = total_bytes.and_then(|total| {
            if speed > 0.0 && bytes_downloaded < total {
                Some((total - bytes_downloaded) as f64 / speed)
            } else {
                None
            }
        });

        Self {
            bytes_downloaded,
            total_bytes,
            speed_bytes_per_sec: speed,
            percent,
            eta_seconds,
        }
    }
}

/// Tunables for the download engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadPolicy {
    /// Write buffer size.
    pub chunk_size: usize,
    /// Wall-clock interval between progress samples.
    pub progress_interval: Duration,
    /// Abort threshold; `None` disables low-speed detection.
    pub low_speed: Option<LowSpeedPolicy>,
    /// Suffix for in-progress files.
    pub temp_suffix: String,
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        Self {
            chunk_size: NetworkConfig::DOWNLOAD_CHUNK_SIZE,
            progress_interval: NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL,
            low_speed: Some(LowSpeedPolicy {
                min_bytes_per_sec: NetworkConfig::LOW_SPEED_THRESHOLD_BYTES as f64,
                grace: NetworkConfig::LOW_SPEED_DURATION,
            }),
            temp_suffix: NetworkConfig::DOWNLOAD_TEMP_SUFFIX.to_string(),
        }
    }
}

/// What to fetch and where to put it.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    /// Fallback size when the server does not announce one.
    pub size_hint: Option<u64>,
    /// Continue an existing partial.
    pub resume: bool,
    /// Replace an existing completed file.
    pub force: bool,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            size_hint: None,
            resume: true,
            force: false,
        }
    }

    pub fn with_size_hint(mut self, size: Option<u64>) -> Self {
        self.size_hint = size;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Result of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    /// Bytes transferred by this call.
    pub bytes_written: u64,
    /// Size of the final file.
    pub total_bytes: u64,
    /// Offset the transfer resumed from (0 for a fresh download).
    pub resumed_from: u64,
}

/// Single-attempt resumable downloader.
pub struct DownloadEngine {
    http: Arc<HttpClient>,
    policy: DownloadPolicy,
}

impl DownloadEngine {
    pub fn new(http: Arc<HttpClient>, policy: DownloadPolicy) -> Self {
        Self { http, policy }
    }

    pub fn policy(&self) -> &DownloadPolicy {
        &self.policy
    }

    /// Download `request.url` to `request.destination`.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        progress_tx: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<DownloadOutcome> {
        let url = request.url.as_str();
        let partial = PartialFile::with_suffix(&request.destination, &self.policy.temp_suffix);

        if !request.force && file_len(&request.destination).await?.is_some() {
            return Err(CivitaiError::DuplicateFile(request.destination.clone()));
        }

        let mut expected_total = match self.probe_size(url).await? {
            Some(size) => Some(size),
            None => request.size_hint,
        };

        if !request.resume {
            partial.discard().await?;
        }
        let mut offset = partial.resume_offset(expected_total).await?;

        if offset > 0 && Some(offset) == expected_total {
            info!(
                "Partial file already complete, finalizing {}",
                request.destination.display()
            );
            let total = partial.promote(expected_total, request.force).await?;
            return Ok(DownloadOutcome {
                path: request.destination.clone(),
                bytes_written: 0,
                total_bytes: total,
                resumed_from: offset,
            });
        }

        // Without a HEAD size, check the server's range against what the
        // partial was started with
        if offset > 0 && expected_total.is_none() {
            expected_total = partial.partial().await?.and_then(|(_, total)| total);
        }

        let mut response = self.open(url, offset).await?;

        if offset > 0 {
            if response.status() == StatusCode::PARTIAL_CONTENT {
                let (start, total) = content_range(&response).unwrap_or((Some(offset), None));
                let total_agrees = match (total, expected_total) {
                    (Some(total), Some(expected)) => total == expected,
                    _ => true,
                };
                if start != Some(offset) || !total_agrees {
                    warn!(
                        "Server range {:?}/{:?} disagrees with partial at {} of {:?}, restarting",
                        start, total, offset, expected_total
                    );
                    partial.discard().await?;
                    offset = 0;
                    expected_total = total.or(expected_total);
                    response = self.open(url, 0).await?;
                }
            } else {
                info!("Server ignored range request, restarting {}", url);
                partial.discard().await?;
                offset = 0;
            }
        }

        if let Some(announced) = announced_total(&response, offset) {
            if expected_total.is_some_and(|e| e != announced) {
                debug!(
                    "Response announces {} bytes, expected {:?}",
                    announced, expected_total
                );
            }
            expected_total = Some(announced);
        }

        partial.begin(url, expected_total).await?;
        info!(
            "Downloading {} -> {} (from byte {}, total {:?})",
            url,
            request.destination.display(),
            offset,
            expected_total
        );

        let on_disk = self
            .stream_body(response, &partial, offset, expected_total, progress_tx.as_ref())
            .await?;

        let total = partial.promote(expected_total, request.force).await?;
        info!("Downloaded {} bytes to {}", total, request.destination.display());

        Ok(DownloadOutcome {
            path: request.destination.clone(),
            bytes_written: on_disk - offset,
            total_bytes: total,
            resumed_from: offset,
        })
    }

    // Internal methods

    /// `Content-Length` from a HEAD request.
    ///
    /// Signed storage URLs often refuse HEAD while serving GET, so only
    /// throttling is final here; access errors are left for the GET to report.
    async fn probe_size(&self, url: &str) -> Result<Option<u64>> {
        match self.http.head(url).await {
            Ok(response) => Ok(header_u64(&response, header::CONTENT_LENGTH).filter(|n| *n > 0)),
            Err(e @ (CivitaiError::RateLimited { .. } | CivitaiError::ServiceUnavailable { .. })) => {
                Err(e)
            }
            Err(e) => {
                debug!("HEAD {} failed, size unknown: {}", url, e);
                Ok(None)
            }
        }
    }

    async fn open(&self, url: &str, offset: u64) -> Result<Response> {
        let response = self
            .http
            .get_stream(url, (offset > 0).then_some(offset))
            .await?;
        HttpClient::ensure_success(response, url).await
    }

    /// Append the body to the partial file, returning its final length.
    async fn stream_body(
        &self,
        response: Response,
        partial: &PartialFile,
        offset: u64,
        expected_total: Option<u64>,
        progress_tx: Option<&mpsc::Sender<DownloadProgress>>,
    ) -> Result<u64> {
        let path = partial.part_path();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(offset > 0)
            .truncate(offset == 0)
            .open(path)
            .await
            .map_err(|e| CivitaiError::Io {
                message: format!("Failed to open partial file: {}", e),
                path: Some(path.to_path_buf()),
                source: Some(e),
            })?;
        let mut writer = BufWriter::with_capacity(self.policy.chunk_size.max(1), file);

        let mut written = offset;
        let mut sampler = ThroughputSampler::new(self.policy.progress_interval, Instant::now());
        let mut detector = self.policy.low_speed.map(LowSpeedDetector::new);
        let mut stream = response.bytes_stream();

        send_progress(progress_tx, DownloadProgress::new(written, expected_total, 0.0)).await;

        let result: Result<()> = async {
            loop {
                // Wake up at every sample boundary even if no bytes arrive
                let wait = sampler.until_next_sample(Instant::now());
                match tokio::time::timeout(wait, stream.next()).await {
                    Ok(Some(chunk)) => {
                        let chunk = chunk.map_err(|e| CivitaiError::Network {
                            message: format!("Error reading download stream: {}", e),
                            cause: Some(e.to_string()),
                        })?;
                        writer.write_all(&chunk).await.map_err(|e| CivitaiError::Io {
                            message: format!("Failed to write to partial file: {}", e),
                            path: Some(path.to_path_buf()),
                            source: Some(e),
                        })?;
                        written += chunk.len() as u64;
                        sampler.record(chunk.len() as u64);
                    }
                    Ok(None) => return Ok(()),
                    Err(_elapsed) => {}
                }

                let now = Instant::now();
                let Some(sample) = sampler.sample(now) else {
                    continue;
                };
                send_progress(
                    progress_tx,
                    DownloadProgress::new(written, expected_total, sample.bytes_per_sec),
                )
                .await;

                if let Some(detector) = detector.as_mut() {
                    if let Some(stalled_for) = detector.observe(sample.bytes_per_sec, now) {
                        return Err(CivitaiError::LowSpeed {
                            bytes_per_sec: sample.bytes_per_sec,
                            threshold: detector.policy().min_bytes_per_sec,
                            stalled_for,
                        });
                    }
                }
            }
        }
        .await;

        // Keep whatever arrived, even on failure
        let flushed = writer.flush().await.map_err(|e| CivitaiError::Io {
            message: format!("Failed to flush partial file: {}", e),
            path: Some(path.to_path_buf()),
            source: Some(e),
        });

        if let Err(e) = result {
            warn!(
                "Download of {} stopped at {} bytes: {}",
                partial.destination().display(),
                written,
                e
            );
            return Err(e);
        }
        flushed?;

        send_progress(
            progress_tx,
            DownloadProgress::new(written, expected_total, sampler.average(Instant::now())),
        )
        .await;

        Ok(written)
    }
}

async fn send_progress(tx: Option<&mpsc::Sender<DownloadProgress>>, progress: DownloadProgress) {
    if let Some(tx) = tx {
        let _ = tx.send(progress).await;
    }
}

fn header_u64(response: &Response, name: header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

/// Full size announced by a GET response.
fn announced_total(response: &Response, offset: u64) -> Option<u64> {
    if response.status() == StatusCode::PARTIAL_CONTENT {
        content_range(response).and_then(|(_, total)| total)
    } else if offset == 0 {
        header_u64(response, header::CONTENT_LENGTH)
    } else {
        None
    }
}

fn content_range(response: &Response) -> Option<(Option<u64>, Option<u64>)> {
    response
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .map(parse_content_range)
}

/// Parse `bytes START-END/TOTAL` into `(start, total)`; `*` totals are `None`.
fn parse_content_range(value: &str) -> (Option<u64>, Option<u64>) {
    let Some(spec) = value.trim().strip_prefix("bytes") else {
        return (None, None);
    };
    let (range, total) = spec.trim().split_once('/').unwrap_or((spec.trim(), "*"));
    let start = range
        .split_once('-')
        .and_then(|(start, _)| start.trim().parse().ok());
    let total = total.trim().parse().ok();
    (start, total)
}
