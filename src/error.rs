//! Typed error hierarchy for gosh-share
//!
//! Errors carry string payloads only so that a downloader's terminal error
//! can be cloned into every handle observing it.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the sharing subsystem
#[derive(Debug, Clone, Error)]
pub enum ShareError {
    /// No usable download source was given
    #[error("no usable source: {0}")]
    Configuration(String),

    /// No contributor of a peer-hosted source is currently online
    #[error("no contributor online for {uri}")]
    SourceOffline { uri: String },

    /// A network source failed (connect, timeout, bad status)
    #[error("source failed ({kind:?}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Local file or directory failure
    #[error("{message} ({})", path.display())]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Bad URI, Range header or source response
    #[error("{kind:?}: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Unknown share id or missing cached file
    #[error("not found: {0}")]
    NotFound(String),

    /// A range was requested but the total size cannot be determined
    #[error("size unknown: {0}")]
    SizeUnknown(String),

    /// Caller passed something unusable
    #[error("bad {field}: {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    #[error("aborted")]
    Aborted,

    /// Cache index failure
    #[error("cache index: {0}")]
    Database(String),

    /// Broken invariant
    #[error("internal: {0}")]
    Internal(String),
}

/// What went wrong talking to a network source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionRefused,
    /// Transfer cut off midway
    ConnectionReset,
    Timeout,
    /// Non-success HTTP status
    HttpStatus(u16),
    TooManyRedirects,
    Other,
}

impl NetworkErrorKind {
    /// Failures where asking the same source again may work
    pub fn is_transient(self) -> bool {
        match self {
            Self::ConnectionRefused | Self::ConnectionReset | Self::Timeout => true,
            Self::HttpStatus(code) => code == 408 || code == 429 || code >= 500,
            Self::TooManyRedirects | Self::Other => false,
        }
    }
}

/// What went wrong on the local filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    NotFound,
    PermissionDenied,
    AlreadyExists,
    InvalidPath,
    /// Any other I/O failure
    Io,
}

impl From<std::io::ErrorKind> for StorageErrorKind {
    fn from(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind as K;
        match kind {
            K::NotFound => Self::NotFound,
            K::PermissionDenied => Self::PermissionDenied,
            K::AlreadyExists => Self::AlreadyExists,
            K::InvalidInput => Self::InvalidPath,
            _ => Self::Io,
        }
    }
}

/// What was wrong with a URI, Range header or source response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Malformed URI
    InvalidUri,
    /// URI scheme with no retrieval strategy
    UnsupportedScheme,
    /// Malformed Range header
    InvalidRange,
    /// Well-formed Range header using an unsupported form
    RangeNotImplemented,
    /// Source can't serve the requested range
    RangeNotSupported,
    /// Source answered something other than what was asked for
    InvalidResponse,
}

impl ShareError {
    /// Whether the same candidate might succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { kind, .. } => kind.is_transient(),
            Self::SourceOffline { .. } => true,
            _ => false,
        }
    }

    /// Whether this is a transfer failure (network or local I/O)
    pub fn is_transfer_error(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Storage { .. })
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            message: message.into(),
        }
    }

    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Attach a path to a storage error produced by a bare `io::Error` conversion
    pub fn at_path(mut self, at: impl Into<PathBuf>) -> Self {
        if let Self::Storage { path, .. } = &mut self {
            *path = at.into();
        }
        self
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ShareError>;

impl From<std::io::Error> for ShareError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.kind().into(), PathBuf::new(), err.to_string())
    }
}

impl From<reqwest::Error> for ShareError {
    fn from(err: reqwest::Error) -> Self {
        let kind = match err.status() {
            Some(status) => NetworkErrorKind::HttpStatus(status.as_u16()),
            None if err.is_timeout() => NetworkErrorKind::Timeout,
            None if err.is_connect() => NetworkErrorKind::ConnectionRefused,
            None if err.is_redirect() => NetworkErrorKind::TooManyRedirects,
            None if err.is_body() || err.is_decode() => NetworkErrorKind::ConnectionReset,
            None => NetworkErrorKind::Other,
        };
        Self::network(kind, err.to_string())
    }
}

impl From<url::ParseError> for ShareError {
    fn from(err: url::ParseError) -> Self {
        Self::protocol(ProtocolErrorKind::InvalidUri, err.to_string())
    }
}

impl From<rusqlite::Error> for ShareError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for ShareError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("metadata encoding: {err}"))
    }
}

impl From<tokio::task::JoinError> for ShareError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task: {err}"))
    }
}
