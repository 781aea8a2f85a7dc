//! File descriptors
//!
//! The canonical description of shared content as announced by peers, and
//! the reference published for a shared item.

use super::types::ShareId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Digest algorithm of a [`FileHash`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

/// A digest of the file content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    pub algorithm: HashAlgorithm,
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

impl FileHash {
    pub fn sha1(value: impl Into<Vec<u8>>) -> Self {
        Self {
            algorithm: HashAlgorithm::Sha1,
            value: value.into(),
        }
    }
}

/// Preview image reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    /// Where the image can be fetched, usually a `cid:` URI
    pub uri: String,
    pub media_type: String,
    pub width: u32,
    pub height: u32,
}

/// Coarse amplitude histogram of an audio clip
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioSpectrum {
    /// Value coding, e.g. `u8`
    pub coding: String,
    pub bars: Vec<u32>,
}

impl AudioSpectrum {
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Bars as a comma separated list
    pub fn bars_csv(&self) -> String {
        self.bars
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse a comma separated bar list, skipping malformed values
    pub fn from_csv(coding: impl Into<String>, csv: &str) -> Self {
        Self {
            coding: coding.into(),
            bars: csv
                .split(',')
                .filter_map(|v| v.trim().parse().ok())
                .collect(),
        }
    }
}

/// Canonical description of a shared file
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: Option<String>,
    pub size: Option<u64>,
    pub media_type: Option<String>,
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hashes: Vec<FileHash>,
    pub thumbnail: Option<Thumbnail>,
    #[serde(default)]
    pub spectrum: AudioSpectrum,
    pub description: Option<String>,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_hash(mut self, hash: FileHash) -> Self {
        self.add_hash(hash);
        self
    }

    /// Add a hash, replacing one of the same algorithm
    pub fn add_hash(&mut self, hash: FileHash) {
        self.hashes.retain(|h| h.algorithm != hash.algorithm);
        self.hashes.push(hash);
    }

    pub fn hash(&self, algorithm: HashAlgorithm) -> Option<&FileHash> {
        self.hashes
            .iter()
            .find(|h| h.algorithm == algorithm && !h.value.is_empty())
    }

    /// Content-derived id: the SHA-1 digest, else the first non-empty hash
    pub fn share_id(&self) -> Option<ShareId> {
        self.hash(HashAlgorithm::Sha1)
            .or_else(|| self.hashes.iter().find(|h| !h.value.is_empty()))
            .map(|h| ShareId::from_digest(&h.value))
    }

    /// Merge another description of the same content into this one
    ///
    /// Returns `false` (leaving `self` untouched) when the two descriptions
    /// contradict each other: different sizes, or different digests for the
    /// same algorithm.
    pub fn merge(&mut self, other: &FileDescriptor) -> bool {
        if let (Some(a), Some(b)) = (self.size, other.size) {
            if a != b {
                return false;
            }
        }
        for theirs in &other.hashes {
            if let Some(ours) = self.hashes.iter().find(|h| h.algorithm == theirs.algorithm) {
                if ours.value != theirs.value {
                    return false;
                }
            }
        }

        for theirs in &other.hashes {
            if self.hash(theirs.algorithm).is_none() {
                self.add_hash(theirs.clone());
            }
        }
        if self.name.is_none() {
            self.name = other.name.clone();
        }
        if self.size.is_none() {
            self.size = other.size;
        }
        if self.media_type.is_none() {
            self.media_type = other.media_type.clone();
        }
        if self.date.is_none() {
            self.date = other.date;
        }
        if self.thumbnail.is_none() {
            self.thumbnail = other.thumbnail.clone();
        }
        if self.spectrum.is_empty() {
            self.spectrum = other.spectrum.clone();
        }
        if self.description.is_none() {
            self.description = other.description.clone();
        }
        true
    }
}

/// A published reference to shared content: its description plus the URIs
/// it can be fetched from, best source first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaShare {
    pub file: FileDescriptor,
    pub sources: Vec<String>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
