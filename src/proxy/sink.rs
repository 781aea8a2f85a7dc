//! Transport abstraction for proxied responses

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Status codes a proxied response can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyStatus {
    Ok,
    PartialContent,
    BadRequest,
    NotFound,
    RangeNotSatisfiable,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
}

impl ProxyStatus {
    pub fn code(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::PartialContent => 206,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::RangeNotSatisfiable => 416,
            Self::NotImplemented => 501,
            Self::BadGateway => 502,
            Self::ServiceUnavailable => 503,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::PartialContent => "Partial Content",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::RangeNotSatisfiable => "Range Not Satisfiable",
            Self::NotImplemented => "Not Implemented",
            Self::BadGateway => "Bad Gateway",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::PartialContent)
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Status line and headers of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: ProxyStatus,
    pub headers: Vec<(&'static str, String)>,
}

impl ResponseHead {
    pub fn new(status: ProxyStatus) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Announced body length
    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")?.parse().ok()
    }
}

/// Where a proxied response goes
///
/// `send_body` resolves once the transport can take more data, which is what
/// keeps a slow consumer from making the proxy buffer ahead. An error from
/// any method means the consumer is gone.
#[async_trait]
pub trait ResponseSink: Send {
    async fn send_head(&mut self, head: ResponseHead) -> Result<()>;

    async fn send_body(&mut self, chunk: Bytes) -> Result<()>;

    /// End of the response
    async fn finish(&mut self) -> Result<()>;
}
