//! Core protocol types
//!
//! Fundamental types used throughout the protocol.

use crate::error::{Result, ShareError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a piece of shareable content
///
/// The lowercase hex encoding of the content's SHA-1 digest (or of the
/// first hash a remote descriptor announced when it carries no SHA-1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareId(String);

impl ShareId {
    /// Create from a hex string, normalising to lowercase
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.is_empty() || hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ShareError::invalid_input(
                "share_id",
                format!("not a hex digest: {:?}", hex),
            ));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// Create from raw digest bytes
    pub fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    /// The hex representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ShareId {
    type Err = ShareError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Address of a peer endpoint (`user@host/resource`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address without the resource part
    pub fn bare(&self) -> &str {
        match self.0.split_once('/') {
            Some((bare, _)) => bare,
            None => &self.0,
        }
    }

    /// Resource part, if any
    pub fn resource(&self) -> Option<&str> {
        self.0
            .split_once('/')
            .map(|(_, res)| res)
            .filter(|res| !res.is_empty())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Retrieval state of a registered source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    /// Not in the cache and no download running
    #[default]
    None,
    /// A downloader is running
    Downloading,
    /// Content was downloaded into the cache
    Cached,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Downloading => write!(f, "downloading"),
            Self::Cached => write!(f, "cached"),
        }
    }
}

/// Half-open byte interval `[start, start + size)`
///
/// `size == None` means "from `start` to the end of the content".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub size: Option<u64>,
}

impl ByteRange {
    /// Range of `size` bytes starting at `start`
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            size: Some(size),
        }
    }

    /// Open-ended range covering everything from `start`
    pub fn from_offset(start: u64) -> Self {
        Self { start, size: None }
    }

    pub fn is_open_ended(&self) -> bool {
        self.size.is_none()
    }

    /// Exclusive end, if bounded
    pub fn end(&self) -> Option<u64> {
        self.size.map(|size| self.start.saturating_add(size))
    }

    /// Clamp the range to content of `total` bytes
    ///
    /// Returns `None` when `start` lies at or beyond the end of the content.
    pub fn clamp(&self, total: u64) -> Option<ByteRange> {
        if self.start >= total {
            return None;
        }
        let available = total - self.start;
        let size = self.size.map_or(available, |s| s.min(available));
        Some(ByteRange::new(self.start, size))
    }

    /// Advance the start by `n` bytes, shrinking a bounded size accordingly
    pub fn skip(&self, n: u64) -> ByteRange {
        ByteRange {
            start: self.start.saturating_add(n),
            size: self.size.map(|s| s.saturating_sub(n)),
        }
    }
}

/// Progress of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Bytes transferred so far
    pub transferred: u64,
    /// Total bytes, if known
    pub total: Option<u64>,
}

impl TransferProgress {
    pub fn percentage(&self) -> Option<f64> {
        self.total.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.transferred as f64 / total as f64) * 100.0
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_id_normalises_hex() {
        let id = ShareId::from_hex("A9993E364706816ABA3E25717850C26C9CD0D89D").unwrap();
        assert_eq!(id.as_str(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(id, ShareId::from_digest(&hex::decode(id.as_str()).unwrap()));

        assert!(ShareId::from_hex("").is_err());
        assert!(ShareId::from_hex("abc").is_err());
        assert!(ShareId::from_hex("zz").is_err());
        assert!("../etc".parse::<ShareId>().is_err());
    }

    #[test]
    fn test_peer_id_parts() {
        let peer = PeerId::new("alice@example.org/phone");
        assert_eq!(peer.bare(), "alice@example.org");
        assert_eq!(peer.resource(), Some("phone"));

        let bare = PeerId::new("alice@example.org");
        assert_eq!(bare.bare(), "alice@example.org");
        assert_eq!(bare.resource(), None);
    }

    #[test]
    fn test_byte_range_clamp() {
        assert_eq!(ByteRange::new(200, 300).clamp(1000), Some(ByteRange::new(200, 300)));
        assert_eq!(ByteRange::new(900, 300).clamp(1000), Some(ByteRange::new(900, 100)));
        assert_eq!(ByteRange::from_offset(10).clamp(1000), Some(ByteRange::new(10, 990)));
        assert_eq!(ByteRange::from_offset(1000).clamp(1000), None);
    }

    #[test]
    fn test_byte_range_skip() {
        assert_eq!(ByteRange::new(10, 100).skip(40), ByteRange::new(50, 60));
        assert_eq!(ByteRange::from_offset(10).skip(5), ByteRange::from_offset(15));
        assert_eq!(ByteRange::new(0, 10).end(), Some(10));
    }
}
