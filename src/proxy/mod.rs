//! Range proxy
//!
//! Answers a (possibly ranged) read request for a share id with a correctly
//! framed HTTP response:
//! - Cached content is served straight from disk
//! - Anything else is pulled through a [`SourceDownloader`] and streamed as
//!   the bytes land, never faster than the consumer takes them
//!
//! One [`RangeProxy`] handles one request and owns whatever downloader it
//! started; the downloader is released on every terminal transition.

pub mod reply;
pub mod server;
pub mod sink;

pub use reply::{reply_channel, ProxyReply, ReplySink};
pub use server::ShareServer;
pub use sink::{ProxyStatus, ResponseHead, ResponseSink};

use crate::cache::{CacheEntry, ContentCache};
use crate::download::{
    DownloadContext, DownloadHandle, DownloadRequest, SourceDownloader, TransferMetadata,
};
use crate::error::{ProtocolErrorKind, Result, ShareError};
use crate::http::{content_range, format_http_date, parse_range_header, unsatisfied_content_range, RangeParse};
use crate::protocol::{ByteRange, ShareId};
use crate::registry::{Source, SourceRegistry};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const OCTET_STREAM: &str = "application/octet-stream";

/// A read request for shared content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub id: ShareId,
    /// Raw `Range` header value, if any
    pub range: Option<String>,
}

impl ProxyRequest {
    pub fn new(id: ShareId) -> Self {
        Self { id, range: None }
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }
}

/// Everything a proxy needs to resolve a request
#[derive(Clone)]
pub struct ProxyContext {
    pub registry: Arc<SourceRegistry>,
    pub cache: Arc<dyn ContentCache>,
    pub downloads: DownloadContext,
    /// Upper bound for a single body write
    pub chunk_size: usize,
}

/// Proxy lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Init,
    /// Answered with an error status before any body byte
    MetadataError,
    ProxyingCache,
    AwaitingDownloaderMetadata,
    Transferring,
    Finished,
}

/// How a proxied request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOutcome {
    pub status: ProxyStatus,
    pub bytes_sent: u64,
}

/// Downloader held by a proxy
enum OwnedDownload {
    /// The source's shared downloader; others may be following it
    Shared(DownloadHandle),
    /// Started for this request's range only
    Dedicated(DownloadHandle),
}

/// Cached content opened for reading
struct CachedFile {
    entry: CacheEntry,
    file: tokio::fs::File,
    size: u64,
    modified: Option<DateTime<Utc>>,
}

/// State machine serving one request
pub struct RangeProxy<S: ResponseSink> {
    ctx: ProxyContext,
    sink: S,
    state: ProxyState,
    /// Set once the head went out; later failures can only cut the body
    status: Option<ProxyStatus>,
    bytes_sent: u64,
    downloader: Option<OwnedDownload>,
}

impl<S: ResponseSink> RangeProxy<S> {
    pub fn new(ctx: ProxyContext, sink: S) -> Self {
        Self {
            ctx,
            sink,
            state: ProxyState::Init,
            status: None,
            bytes_sent: 0,
            downloader: None,
        }
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    /// Serve `request` to completion
    pub async fn run(mut self, request: ProxyRequest) -> ProxyOutcome {
        if let Err(e) = self.serve(&request).await {
            tracing::debug!("Proxy for {} cut short: {}", request.id, e);
        }
        self.finish().await;
        self.release();

        let outcome = ProxyOutcome {
            status: self.status.unwrap_or(ProxyStatus::BadGateway),
            bytes_sent: self.bytes_sent,
        };
        tracing::info!(
            "Proxied {} ({:?}): {}, {} bytes",
            request.id,
            request.range,
            outcome.status,
            outcome.bytes_sent
        );
        outcome
    }

    fn transition(&mut self, state: ProxyState) {
        tracing::trace!("Proxy state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    async fn serve(&mut self, request: &ProxyRequest) -> Result<()> {
        let source = self.ctx.registry.get(&request.id);
        let cached = self.open_cached(&request.id).await;
        if source.is_none() && cached.is_none() {
            return self.fail(ProxyStatus::NotFound).await;
        }

        let known_size = cached
            .as_ref()
            .map(|c| c.size)
            .or_else(|| source.as_ref().and_then(|s| s.file.size));
        let range = match request.range.as_deref() {
            None => None,
            Some(value) => match parse_range_header(value, known_size) {
                RangeParse::Parsed(range) => Some(range),
                RangeParse::Unparsed => return self.fail(ProxyStatus::BadRequest).await,
                RangeParse::NotImplementedRangeType
                | RangeParse::NotImplementedTailLoad
                | RangeParse::NotImplementedMultirange => {
                    return self.fail(ProxyStatus::NotImplemented).await
                }
                RangeParse::OutOfRange => return self.range_not_satisfiable(known_size).await,
            },
        };

        if let Some(cached) = cached {
            tracing::debug!("Serving {} from cache", request.id);
            self.transition(ProxyState::ProxyingCache);
            return self.serve_cached(cached, range).await;
        }
        match source {
            Some(source) => self.serve_download(source, range).await,
            None => self.fail(ProxyStatus::NotFound).await,
        }
    }

    async fn open_cached(&self, id: &ShareId) -> Option<CachedFile> {
        let entry = match self.ctx.cache.get(id, true).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Cache lookup for {} failed: {}", id, e);
                return None;
            }
        };
        let path = entry.file_path();
        let opened = async {
            let file = tokio::fs::File::open(&path).await?;
            let meta = file.metadata().await?;
            std::io::Result::Ok((file, meta))
        }
        .await;
        match opened {
            Ok((file, meta)) => Some(CachedFile {
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                entry,
                file,
            }),
            Err(e) => {
                tracing::warn!("Cached file {:?} for {} is unusable: {}", path, id, e);
                None
            }
        }
    }

    async fn serve_cached(&mut self, cached: CachedFile, range: Option<ByteRange>) -> Result<()> {
        let CachedFile {
            entry,
            mut file,
            size,
            modified,
        } = cached;

        let (status, start, len) = match range {
            Some(range) => match range.clamp(size) {
                Some(clamped) => (
                    ProxyStatus::PartialContent,
                    clamped.start,
                    clamped.size.unwrap_or(0),
                ),
                None => return self.range_not_satisfiable(Some(size)).await,
            },
            None => (ProxyStatus::Ok, 0, size),
        };

        let media_type = entry.metadata.media_type.as_deref().unwrap_or(OCTET_STREAM);
        let mut head = ResponseHead::new(status)
            .with_header("Content-Type", media_type)
            .with_header("Accept-Ranges", "bytes")
            .with_header("Content-Length", len.to_string())
            .with_header("Connection", "keep-alive");
        if let Some(modified) = modified {
            head = head.with_header("Last-Modified", format_http_date(&modified));
        }
        if status == ProxyStatus::PartialContent {
            head = head.with_header("Content-Range", content_range(start, len, Some(size)));
        }

        file.seek(SeekFrom::Start(start)).await?;
        self.commit(head).await?;
        self.transition(ProxyState::Transferring);

        let mut left = len;
        while left > 0 {
            let want = left.min(self.ctx.chunk_size as u64) as usize;
            let mut buf = BytesMut::zeroed(want);
            let read = file.read(&mut buf).await?;
            if read == 0 {
                tracing::warn!("Cached file for {} shrank while serving", entry.id);
                break;
            }
            buf.truncate(read);
            self.send(buf.freeze()).await?;
            left -= read as u64;
        }
        Ok(())
    }

    async fn serve_download(&mut self, source: Source, range: Option<ByteRange>) -> Result<()> {
        let handle = match range {
            Some(range) => {
                if source.uris.is_empty() {
                    let error = ShareError::configuration("Download sources are not given");
                    return self.fail_with(&error).await;
                }
                let request = DownloadRequest {
                    id: source.id.clone(),
                    file: source.file.clone(),
                    contributors: source.contributors.clone(),
                    uris: source.uris.clone(),
                    range: Some(range),
                };
                let handle = SourceDownloader::spawn(request, self.ctx.downloads.clone());
                self.downloader = Some(OwnedDownload::Dedicated(handle.clone()));
                handle
            }
            None => match self.ctx.registry.download_share(&source.id, &self.ctx.downloads) {
                Ok(handle) => {
                    self.downloader = Some(OwnedDownload::Shared(handle.clone()));
                    handle
                }
                Err(e) => return self.fail_with(&e).await,
            },
        };

        self.transition(ProxyState::AwaitingDownloaderMetadata);
        let metadata = match handle.metadata_ready().await {
            Ok(metadata) => metadata,
            Err(e) => return self.fail_with(&e).await,
        };

        let Some(head) = self.download_head(&source, range, &metadata) else {
            return self.fail(ProxyStatus::NotImplemented).await;
        };
        let mut left = head.content_length();
        self.commit(head).await?;
        self.transition(ProxyState::Transferring);

        let mut reader = handle.reader();
        let chunk_size = self.ctx.chunk_size as u64;
        loop {
            let want = match left {
                Some(0) => break,
                Some(left) => left.min(chunk_size),
                None => chunk_size,
            };
            match reader.read_chunk(want as usize).await {
                Ok(Some(chunk)) => {
                    let sent = chunk.len() as u64;
                    self.send(chunk).await?;
                    left = left.map(|l| l.saturating_sub(sent));
                }
                Ok(None) => break,
                Err(e) => {
                    // Headers are out, all we can do is end the body
                    tracing::debug!("Downloader for {} stopped mid-response: {}", source.id, e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Head for a response fed by a downloader, `None` if the part the
    /// source agreed to deliver has no known length
    ///
    /// A partial response covers the requested range, clamped to what the
    /// source announced, never the larger range a source may have offered.
    fn download_head(
        &self,
        source: &Source,
        requested: Option<ByteRange>,
        metadata: &TransferMetadata,
    ) -> Option<ResponseHead> {
        let metadata = match requested {
            Some(requested) => metadata.clone().narrowed_to(requested),
            None => metadata.clone(),
        };
        let len = metadata.expected_len();
        let partial = match (requested, metadata.range) {
            (Some(_), Some(delivered)) => Some((delivered.start, len?)),
            // Source can't do ranges: the whole content follows
            _ => None,
        };

        let media_type = metadata
            .media_type
            .as_deref()
            .or(source.file.media_type.as_deref())
            .unwrap_or(OCTET_STREAM);
        let status = if partial.is_some() {
            ProxyStatus::PartialContent
        } else {
            ProxyStatus::Ok
        };
        let mut head = ResponseHead::new(status)
            .with_header("Content-Type", media_type)
            .with_header("Accept-Ranges", "bytes");
        if let Some(modified) = metadata.last_modified {
            head = head.with_header("Last-Modified", format_http_date(&modified));
        }
        if let Some((start, len)) = partial {
            head = head.with_header("Content-Range", content_range(start, len, metadata.total_size));
        }
        if let Some(len) = len {
            head = head
                .with_header("Content-Length", len.to_string())
                .with_header("Connection", "keep-alive");
        }
        Some(head)
    }

    async fn commit(&mut self, head: ResponseHead) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        self.status = Some(head.status);
        self.sink.send_head(head).await
    }

    async fn send(&mut self, chunk: Bytes) -> Result<()> {
        let len = chunk.len() as u64;
        self.sink.send_body(chunk).await?;
        self.bytes_sent += len;
        Ok(())
    }

    /// Answer with an error status, unless a response is already underway
    async fn fail(&mut self, status: ProxyStatus) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        tracing::debug!("Proxy answering {}", status);
        self.transition(ProxyState::MetadataError);
        self.commit(ResponseHead::new(status).with_header("Content-Length", "0"))
            .await
    }

    async fn fail_with(&mut self, error: &ShareError) -> Result<()> {
        tracing::debug!("Proxy can't serve: {}", error);
        self.fail(status_for(error)).await
    }

    async fn range_not_satisfiable(&mut self, size: Option<u64>) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        self.transition(ProxyState::MetadataError);
        let mut head = ResponseHead::new(ProxyStatus::RangeNotSatisfiable)
            .with_header("Content-Length", "0");
        if let Some(size) = size {
            head = head.with_header("Content-Range", unsatisfied_content_range(size));
        }
        self.commit(head).await
    }

    /// End the exchange; only the first call has any effect
    async fn finish(&mut self) {
        if self.state == ProxyState::Finished {
            return;
        }
        if self.status.is_none() {
            // Nothing was committed at all
            let _ = self.fail(ProxyStatus::BadGateway).await;
        }
        self.transition(ProxyState::Finished);
        if let Err(e) = self.sink.finish().await {
            tracing::debug!("Failed to finish response: {}", e);
        }
    }

    fn release(&mut self) {
        match self.downloader.take() {
            Some(OwnedDownload::Dedicated(handle)) if handle.is_connected() => {
                tracing::debug!("Aborting ranged download of {}", handle.id());
                handle.abort();
            }
            _ => {}
        }
    }
}

/// Status for an error hit before the response head went out
pub fn status_for(error: &ShareError) -> ProxyStatus {
    match error {
        ShareError::Configuration(_) => ProxyStatus::ServiceUnavailable,
        ShareError::SizeUnknown(_) => ProxyStatus::NotImplemented,
        ShareError::NotFound(_) => ProxyStatus::NotFound,
        ShareError::Protocol {
            kind: ProtocolErrorKind::InvalidRange,
            ..
        } => ProxyStatus::BadRequest,
        ShareError::Protocol {
            kind: ProtocolErrorKind::RangeNotImplemented,
            ..
        } => ProxyStatus::NotImplemented,
        _ => ProxyStatus::BadGateway,
    }
}

/// Serve `request` in a background task, returning the in-process reply
pub fn spawn_reply(ctx: ProxyContext, request: ProxyRequest, buffer: usize) -> ProxyReply {
    let (sink, reply) = reply_channel(buffer);
    tokio::spawn(RangeProxy::new(ctx, sink).run(request));
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&ShareError::configuration("Download sources are not given")),
            ProxyStatus::ServiceUnavailable
        );
        assert_eq!(
            status_for(&ShareError::SizeUnknown("x".into())),
            ProxyStatus::NotImplemented
        );
        assert_eq!(
            status_for(&ShareError::NotFound("x".into())),
            ProxyStatus::NotFound
        );
        assert_eq!(
            status_for(&ShareError::SourceOffline { uri: "cid:x".into() }),
            ProxyStatus::BadGateway
        );
        assert_eq!(status_for(&ShareError::Aborted), ProxyStatus::BadGateway);
    }

    #[test]
    fn test_request_builder() {
        let id = ShareId::from_digest(&[1; 20]);
        let request = ProxyRequest::new(id.clone()).with_range("bytes=0-9");
        assert_eq!(request.id, id);
        assert_eq!(request.range.as_deref(), Some("bytes=0-9"));
    }
}
