//! Content Cache
//!
//! Content-addressed store for shared files. Entries are keyed by share id
//! and either hold the payload themselves or link to a file that lives
//! elsewhere (a completed download, a file the user shared). Every entry
//! expires after its TTL unless it is looked up with `reborn`.

pub mod sqlite;

pub use sqlite::FileCache;

use crate::error::Result;
use crate::protocol::{AudioSpectrum, ShareId};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Metadata stored with a cache entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Media type of the content
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// URIs the content was retrieved from or published to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,

    /// Path of the file holding the content, when not stored in the cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<PathBuf>,

    /// Thumbnail URI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,

    /// Audio spectrum bars, comma separated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectrum: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectrum_coding: Option<String>,

    /// Anything else, e.g. a voice clip histogram
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl CacheMetadata {
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_link(mut self, path: impl Into<PathBuf>) -> Self {
        self.link = Some(path.into());
        self
    }

    pub fn with_uris(mut self, uris: Vec<String>) -> Self {
        self.uris = uris;
        self
    }

    /// Store an audio spectrum as `spectrum` + `spectrum_coding`
    pub fn set_spectrum(&mut self, spectrum: &AudioSpectrum) {
        if spectrum.is_empty() {
            return;
        }
        self.spectrum = Some(spectrum.bars_csv());
        self.spectrum_coding = Some(spectrum.coding.clone());
    }

    pub fn audio_spectrum(&self) -> Option<AudioSpectrum> {
        let bars = self.spectrum.as_deref()?;
        let spectrum =
            AudioSpectrum::from_csv(self.spectrum_coding.clone().unwrap_or_default(), bars);
        (!spectrum.is_empty()).then_some(spectrum)
    }
}

/// A cached piece of content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: ShareId,
    /// Where the payload is stored inside the cache directory
    pub data_path: PathBuf,
    /// Content size in bytes
    pub size: u64,
    pub metadata: CacheMetadata,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Lifetime in seconds, reapplied on reborn lookups
    pub ttl: u64,
}

impl CacheEntry {
    /// Path of the file holding the content
    pub fn file_path(&self) -> PathBuf {
        self.metadata
            .link
            .clone()
            .unwrap_or_else(|| self.data_path.clone())
    }

    pub fn is_link(&self) -> bool {
        self.metadata.link.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Content cache contract
///
/// Implementations handle their own locking; every method may be called
/// concurrently.
#[async_trait]
pub trait ContentCache: Send + Sync {
    /// Look up an entry
    ///
    /// Expired entries are dropped and reported as missing. With `reborn`
    /// the entry's expiry is pushed out by its TTL.
    async fn get(&self, id: &ShareId, reborn: bool) -> Result<Option<CacheEntry>>;

    /// Store content under `id`, replacing an existing entry
    ///
    /// An empty `data` with a `link` in the metadata records the linked file
    /// instead of copying it.
    async fn append(
        &self,
        id: &ShareId,
        data: Bytes,
        metadata: CacheMetadata,
        ttl: u64,
    ) -> Result<CacheEntry>;

    /// Remove an entry, returning whether it existed
    async fn remove(&self, id: &ShareId) -> Result<bool>;

    /// Drop all expired entries, returning how many were removed
    async fn purge_expired(&self) -> Result<usize>;
}
