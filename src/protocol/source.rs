//! Source URI classification
//!
//! Every retrieval URI maps to a [`SourceType`]; the type doubles as the
//! source's priority when picking which URI to try first.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a retrieval URI, ordered by ascending priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Unrecognised scheme, never used
    None,
    /// Bits of Binary: small payload embedded in the messaging stream (`cid:`)
    Bob,
    /// Network fetch over FTP (`ftp:`, `ftps:`)
    Ftp,
    /// Negotiated peer-to-peer transfer (`xmpp:...?jingle-ft`)
    Jingle,
    /// Network fetch over HTTP (`http:`, `https:`)
    Http,
}

impl SourceType {
    /// Classify a URI by its scheme prefix (case-insensitive)
    pub fn of(uri: &str) -> Self {
        let lower = uri.trim_start().to_ascii_lowercase();
        if lower.starts_with("http") {
            Self::Http
        } else if lower.starts_with("xmpp") {
            Self::Jingle
        } else if lower.starts_with("ftp") {
            Self::Ftp
        } else if lower.starts_with("cid:") {
            Self::Bob
        } else {
            Self::None
        }
    }

    /// Whether the URI can be handed to a plain network client as is
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Http | Self::Ftp)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Bob => write!(f, "bob"),
            Self::Ftp => write!(f, "ftp"),
            Self::Jingle => write!(f, "jingle"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Sort URIs by ascending priority, dropping unusable ones
///
/// The sort is stable, so URIs of the same type keep their relative order.
/// Consumers take candidates from the back.
pub fn sort_by_priority<S: AsRef<str> + Clone>(uris: &[S]) -> Vec<S> {
    let mut sorted: Vec<S> = uris
        .iter()
        .filter(|uri| SourceType::of(uri.as_ref()) != SourceType::None)
        .cloned()
        .collect();
    sorted.sort_by_key(|uri| SourceType::of(uri.as_ref()));
    sorted
}
