//! On-disk resume state for a single download.
//!
//! A destination moves through `Absent → Partial → Complete`. The partial
//! bytes live in `<destination>.part`; a small JSON sidecar next to it
//! remembers the source URL and the total size expected when the partial was
//! started, so a later attempt can tell whether the remote file changed.
//! `Complete` is only reachable through [`PartialFile::promote`], which checks
//! the byte count before the rename.

use crate::config::NetworkConfig;
use crate::error::{CivitaiError, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where a destination currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Absent,
    Partial {
        bytes: u64,
        expected_total: Option<u64>,
    },
    Complete {
        bytes: u64,
    },
}

/// Sidecar contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PartialMeta {
    url: String,
    expected_total: Option<u64>,
    started_at: String,
}

/// Paths and transitions for one destination file.
#[derive(Debug, Clone)]
pub struct PartialFile {
    destination: PathBuf,
    part_path: PathBuf,
    meta_path: PathBuf,
}

impl PartialFile {
    /// Use the default `.part` / `.part.json` suffixes.
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self::with_suffix(destination, NetworkConfig::DOWNLOAD_TEMP_SUFFIX)
    }

    pub fn with_suffix(destination: impl Into<PathBuf>, suffix: &str) -> Self {
        let destination = destination.into();
        let part_path = PathBuf::from(format!("{}{}", destination.display(), suffix));
        let meta_path = PathBuf::from(format!("{}.json", part_path.display()));
        Self {
            destination,
            part_path,
            meta_path,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Current state. A finished file shadows any stray partial.
    pub async fn state(&self) -> Result<TransferState> {
        if let Some(bytes) = file_len(&self.destination).await? {
            return Ok(TransferState::Complete { bytes });
        }
        Ok(match self.partial().await? {
            Some((bytes, expected_total)) => TransferState::Partial {
                bytes,
                expected_total,
            },
            None => TransferState::Absent,
        })
    }

    /// Partial length and the expectation recorded with it, if any.
    pub async fn partial(&self) -> Result<Option<(u64, Option<u64>)>> {
        let Some(bytes) = file_len(&self.part_path).await? else {
            return Ok(None);
        };
        let expected_total = self.read_meta().await.and_then(|m| m.expected_total);
        Ok(Some((bytes, expected_total)))
    }

    /// Decide where to resume against the current remote total.
    ///
    /// Discards the partial (returning 0) when it is empty, longer than the
    /// remote total, or was started against a different total.
    pub async fn resume_offset(&self, expected_total: Option<u64>) -> Result<u64> {
        let Some((bytes, prior_total)) = self.partial().await? else {
            return Ok(0);
        };

        if bytes == 0 {
            self.discard().await?;
            return Ok(0);
        }

        if let (Some(prior), Some(current)) = (prior_total, expected_total) {
            if prior != current {
                info!(
                    "Remote size changed ({} -> {} bytes), restarting {}",
                    prior,
                    current,
                    self.destination.display()
                );
                self.discard().await?;
                return Ok(0);
            }
        }

        if let Some(total) = expected_total {
            if bytes > total {
                warn!(
                    "Partial file has {} bytes but remote has {}, restarting {}",
                    bytes,
                    total,
                    self.destination.display()
                );
                self.discard().await?;
                return Ok(0);
            }
        }

        Ok(bytes)
    }

    /// Record the expectation for the partial that is about to be written.
    pub async fn begin(&self, url: &str, expected_total: Option<u64>) -> Result<()> {
        if let Some(parent) = self.part_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CivitaiError::io_with_path(e, parent))?;
        }

        let meta = PartialMeta {
            url: url.to_string(),
            expected_total,
            started_at: chrono::Local::now().to_rfc3339(),
        };
        let json = serde_json::to_vec_pretty(&meta)?;
        tokio::fs::write(&self.meta_path, json)
            .await
            .map_err(|e| CivitaiError::io_with_path(e, &self.meta_path))
    }

    /// Remove the partial and its sidecar.
    pub async fn discard(&self) -> Result<()> {
        debug!("Discarding partial {}", self.part_path.display());
        remove_if_exists(&self.part_path).await?;
        remove_if_exists(&self.meta_path).await
    }

    /// `Partial → Complete`: verify the byte count, then rename atomically.
    pub async fn promote(&self, expected_total: Option<u64>, replace_existing: bool) -> Result<u64> {
        let bytes = file_len(&self.part_path).await?.ok_or_else(|| CivitaiError::Io {
            message: "partial file vanished before completion".to_string(),
            path: Some(self.part_path.clone()),
            source: None,
        })?;

        if let Some(expected) = expected_total {
            if bytes != expected {
                return Err(CivitaiError::Integrity {
                    path: self.part_path.clone(),
                    expected,
                    actual: bytes,
                });
            }
        }

        if file_len(&self.destination).await?.is_some() {
            if !replace_existing {
                return Err(CivitaiError::DuplicateFile(self.destination.clone()));
            }
            remove_if_exists(&self.destination).await?;
        }

        tokio::fs::rename(&self.part_path, &self.destination)
            .await
            .map_err(|e| CivitaiError::Io {
                message: format!("Failed to move download to final destination: {}", e),
                path: Some(self.destination.clone()),
                source: Some(e),
            })?;

        if let Err(e) = remove_if_exists(&self.meta_path).await {
            warn!("Failed to remove {}: {}", self.meta_path.display(), e);
        }

        Ok(bytes)
    }

    async fn read_meta(&self) -> Option<PartialMeta> {
        let bytes = match tokio::fs::read(&self.meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read {}: {}", self.meta_path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("Ignoring malformed {}: {}", self.meta_path.display(), e);
                None
            }
        }
    }
}

pub(crate) async fn file_len(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CivitaiError::io_with_path(e, path)),
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CivitaiError::io_with_path(e, path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PartialFile) {
        let tmp = TempDir::new().unwrap();
        let partial = PartialFile::new(tmp.path().join("model.safetensors"));
        (tmp, partial)
    }

    #[tokio::test]
    async fn test_state_machine_transitions() {
        let (_tmp, partial) = setup();
        assert_eq!(partial.state().await.unwrap(), TransferState::Absent);

        partial.begin("http://x/file", Some(4)).await.unwrap();
        std::fs::write(partial.part_path(), b"ab").unwrap();
        assert_eq!(
            partial.state().await.unwrap(),
            TransferState::Partial {
                bytes: 2,
                expected_total: Some(4)
            }
        );

        std::fs::write(partial.part_path(), b"abcd").unwrap();
        assert_eq!(partial.promote(Some(4), false).await.unwrap(), 4);
        assert_eq!(
            partial.state().await.unwrap(),
            TransferState::Complete { bytes: 4 }
        );
        assert!(!partial.part_path().exists());
        assert!(!partial.meta_path().exists());
    }

    #[tokio::test]
    async fn test_promote_rejects_short_file() {
        let (_tmp, partial) = setup();
        std::fs::write(partial.part_path(), b"abc").unwrap();

        let err = partial.promote(Some(10), false).await.unwrap_err();
        assert!(matches!(
            err,
            CivitaiError::Integrity {
                expected: 10,
                actual: 3,
                ..
            }
        ));
        // Partial progress survives
        assert!(partial.part_path().exists());
        assert!(!partial.destination().exists());
    }

    #[tokio::test]
    async fn test_promote_respects_existing_file() {
        let (_tmp, partial) = setup();
        std::fs::write(partial.destination(), b"old").unwrap();
        std::fs::write(partial.part_path(), b"new!").unwrap();

        let err = partial.promote(Some(4), false).await.unwrap_err();
        assert!(matches!(err, CivitaiError::DuplicateFile(_)));

        partial.promote(Some(4), true).await.unwrap();
        assert_eq!(std::fs::read(partial.destination()).unwrap(), b"new!");
    }

    #[tokio::test]
    async fn test_resume_offset_keeps_consistent_partial() {
        let (_tmp, partial) = setup();
        partial.begin("u", Some(100)).await.unwrap();
        std::fs::write(partial.part_path(), vec![0u8; 40]).unwrap();

        assert_eq!(partial.resume_offset(Some(100)).await.unwrap(), 40);
        assert_eq!(partial.resume_offset(None).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_resume_offset_discards_on_total_change() {
        let (_tmp, partial) = setup();
        partial.begin("u", Some(100)).await.unwrap();
        std::fs::write(partial.part_path(), vec![0u8; 40]).unwrap();

        assert_eq!(partial.resume_offset(Some(120)).await.unwrap(), 0);
        assert!(!partial.part_path().exists());
        assert!(!partial.meta_path().exists());
    }

    #[tokio::test]
    async fn test_resume_offset_discards_oversized_partial() {
        let (_tmp, partial) = setup();
        // No sidecar: legacy partial from an older run
        std::fs::write(partial.part_path(), vec![0u8; 50]).unwrap();

        assert_eq!(partial.resume_offset(Some(30)).await.unwrap(), 0);
        assert!(!partial.part_path().exists());
    }

    #[tokio::test]
    async fn test_malformed_sidecar_is_ignored() {
        let (_tmp, partial) = setup();
        std::fs::write(partial.part_path(), vec![0u8; 5]).unwrap();
        std::fs::write(partial.meta_path(), b"{oops").unwrap();

        assert_eq!(partial.partial().await.unwrap(), Some((5, None)));
        assert_eq!(partial.resume_offset(Some(10)).await.unwrap(), 5);
    }
}
