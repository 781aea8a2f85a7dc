//! Content hashing
//!
//! Share ids are SHA-1 digests of the shared bytes.

use crate::error::{Result, ShareError};
use crate::protocol::ShareId;
use sha1::{Digest, Sha1};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Digest of an in-memory payload
pub fn sha1_bytes(data: &[u8]) -> ShareId {
    ShareId::from_digest(&Sha1::digest(data))
}

/// Digest of a file's content, read in 64 KiB blocks
pub async fn sha1_file(path: &Path) -> Result<ShareId> {
    let mut file = File::open(path).await.map_err(|e| ShareError::from(e).at_path(path))?;
    let mut block = vec![0u8; 64 * 1024];
    let mut hasher = Sha1::new();
    loop {
        match file.read(&mut block).await {
            Ok(0) => return Ok(ShareId::from_digest(&hasher.finalize())),
            Ok(n) => hasher.update(&block[..n]),
            Err(e) => return Err(ShareError::from(e).at_path(path)),
        }
    }
}
