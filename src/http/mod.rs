//! HTTP network sources
//!
//! This module handles retrieval from `http(s)://` (and, best effort,
//! `ftp://`) URIs:
//! - Ranged GET requests with `Content-Range` validation
//! - Fallback to the whole body when a server ignores the `Range` header
//! - Connection pooling with an optional download rate limit
//! - `Range` header parsing for the proxy side

pub mod connection;
pub mod range;

pub use connection::{ConnectionPool, ConnectionStats};
pub use range::{
    content_range, parse_content_range, parse_range_header, range_request_header,
    unsatisfied_content_range, RangeParse,
};

use crate::config::ShareConfig;
use crate::download::transfer::{OpenedTransfer, TransferMetadata};
use crate::error::{NetworkErrorKind, ProtocolErrorKind, Result, ShareError};
use crate::protocol::ByteRange;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LAST_MODIFIED, RANGE};
use reqwest::StatusCode;
use std::sync::Arc;

/// Opens network sources as byte streams
#[derive(Clone)]
pub struct HttpSource {
    pool: Arc<ConnectionPool>,
}

impl HttpSource {
    /// Create a source backed by a fresh connection pool
    pub fn new(config: &ShareConfig) -> Result<Self> {
        let pool = ConnectionPool::with_limit(&config.http, &config.user_agent, config.download_limit)?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn with_pool(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Start fetching `url`, optionally asking for `range` only
    ///
    /// The returned metadata tells whether the server honoured the range:
    /// `metadata.range` is `None` when the whole body follows.
    pub async fn open(&self, url: &str, range: Option<ByteRange>) -> Result<OpenedTransfer> {
        let parsed = url::Url::parse(url)?;
        let mut request = self.pool.client().get(parsed);
        if let Some(ref range) = range {
            request = request.header(RANGE, range_request_header(range));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.pool.record_failure(&e.to_string());
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.pool.record_failure(&format!("HTTP error: {}", status));
            return Err(ShareError::network(
                NetworkErrorKind::HttpStatus(status.as_u16()),
                format!("HTTP error: {}", status),
            ));
        }
        self.pool.record_success();

        let headers = response.headers();
        let mut metadata = TransferMetadata {
            media_type: header_str(headers, CONTENT_TYPE.as_str()).map(str::to_string),
            last_modified: header_str(headers, LAST_MODIFIED.as_str()).and_then(parse_http_date),
            ..Default::default()
        };

        if status == StatusCode::PARTIAL_CONTENT {
            let value = header_str(headers, CONTENT_RANGE.as_str()).ok_or_else(|| {
                ShareError::protocol(
                    ProtocolErrorKind::InvalidResponse,
                    "206 response without Content-Range",
                )
            })?;
            let (start, end, total) = parse_content_range(value).ok_or_else(|| {
                ShareError::protocol(
                    ProtocolErrorKind::InvalidResponse,
                    format!("Invalid Content-Range header: {}", value),
                )
            })?;
            let expected_start = range.map_or(0, |r| r.start);
            if start != expected_start {
                return Err(ShareError::protocol(
                    ProtocolErrorKind::InvalidResponse,
                    format!(
                        "Range position mismatch: expected {}, got {}",
                        expected_start, start
                    ),
                ));
            }
            metadata.range = Some(ByteRange::new(start, end - start + 1));
            metadata.total_size = total;
        } else {
            if range.is_some() {
                tracing::debug!("{} ignored the Range header, whole body follows", url);
            }
            metadata.total_size = header_str(headers, CONTENT_LENGTH.as_str())
                .and_then(|v| v.parse::<u64>().ok());
        }

        tracing::debug!(
            "Opened {}: status={} range={:?} total={:?}",
            url,
            status,
            metadata.range,
            metadata.total_size
        );

        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| {
                    ShareError::network(NetworkErrorKind::Other, format!("Stream error: {}", e))
                })
            })
            .boxed();

        Ok(OpenedTransfer { metadata, body })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Parse an HTTP date (`Wed, 21 Oct 2015 07:28:00 GMT`)
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Format a timestamp for `Last-Modified`
pub fn format_http_date(date: &DateTime<Utc>) -> String {
    date.to_rfc2822()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source() -> HttpSource {
        HttpSource::new(&ShareConfig::default()).unwrap()
    }

    async fn collect(transfer: OpenedTransfer) -> Vec<u8> {
        let chunks: Vec<bytes::Bytes> = transfer.body.try_collect().await.unwrap();
        chunks.concat()
    }

    #[test]
    fn test_http_date_round_trip() {
        let parsed = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap());
        assert_eq!(parse_http_date(&format_http_date(&parsed)), Some(parsed));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[tokio::test]
    async fn test_open_full_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"hello world".to_vec())
                    .insert_header("Content-Type", "application/octet-stream"),
            )
            .mount(&server)
            .await;

        let transfer = source()
            .open(&format!("{}/file.bin", server.uri()), None)
            .await
            .unwrap();
        assert_eq!(transfer.metadata.range, None);
        assert_eq!(transfer.metadata.total_size, Some(11));
        assert_eq!(
            transfer.metadata.media_type.as_deref(),
            Some("application/octet-stream")
        );
        assert_eq!(collect(transfer).await, b"hello world");
    }

    #[tokio::test]
    async fn test_open_ranged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("Range", "bytes=6-10"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(b"world".to_vec())
                    .insert_header("Content-Range", "bytes 6-10/11"),
            )
            .mount(&server)
            .await;

        let transfer = source()
            .open(&format!("{}/file.bin", server.uri()), Some(ByteRange::new(6, 5)))
            .await
            .unwrap();
        assert_eq!(transfer.metadata.range, Some(ByteRange::new(6, 5)));
        assert_eq!(transfer.metadata.total_size, Some(11));
        assert_eq!(collect(transfer).await, b"world");
    }

    #[tokio::test]
    async fn test_open_range_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let transfer = source()
            .open(&format!("{}/file.bin", server.uri()), Some(ByteRange::from_offset(6)))
            .await
            .unwrap();
        assert_eq!(transfer.metadata.range, None);
        assert_eq!(transfer.metadata.total_size, Some(11));
    }

    #[tokio::test]
    async fn test_open_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = source();
        let err = source
            .open(&format!("{}/missing", server.uri()), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ShareError::Network {
                kind: NetworkErrorKind::HttpStatus(404),
                ..
            }
        ));
        assert_eq!(source.pool().stats().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_open_rejects_misplaced_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(b"hello".to_vec())
                    .insert_header("Content-Range", "bytes 0-4/11"),
            )
            .mount(&server)
            .await;

        let err = source()
            .open(&format!("{}/file.bin", server.uri()), Some(ByteRange::from_offset(6)))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ShareError::Protocol {
                kind: ProtocolErrorKind::InvalidResponse,
                ..
            }
        ));
    }
}
