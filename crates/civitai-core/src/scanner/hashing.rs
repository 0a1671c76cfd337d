//! Streaming SHA-256 for model files.

use crate::config::ScanConfig;
use crate::error::{CivitaiError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Hash a file in fixed-size chunks. Returns lowercase hex.
pub fn compute_sha256(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| CivitaiError::io_with_path(e, path))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; ScanConfig::HASH_CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| CivitaiError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// [`compute_sha256`] on the blocking pool.
pub async fn compute_sha256_async(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || compute_sha256(&path))
        .await
        .map_err(|e| CivitaiError::Other(format!("Hash computation task failed: {}", e)))?
}
