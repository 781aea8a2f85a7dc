//! Source Downloader
//!
//! Retrieves the content of one share from its candidate URIs:
//! - Candidates are tried from the highest source priority down
//! - A failed candidate hands over to the next one, resuming at the first
//!   byte not yet written when the next source can serve that range
//! - Bytes land in a `dl-*` temporary file in the documents directory that
//!   any number of [`DownloadReader`]s can follow while it grows
//! - A complete download is renamed into the documents directory and
//!   recorded in the content cache; a partial (ranged) one is kept alive
//!   only as long as someone holds a handle to it
//!
//! Each downloader is one task publishing a [`DownloadSnapshot`] through a
//! watch channel; [`DownloadHandle`]s observe it.

pub mod candidates;
pub mod naming;
pub mod peer;
pub mod reader;
pub mod transfer;

pub use candidates::{CandidateFailure, CandidateQueue};
pub use peer::{BobData, OfflinePeers, PeerNetwork};
pub use reader::DownloadReader;
pub use transfer::{ByteStream, OpenedTransfer, TransferMetadata};

use crate::cache::{CacheMetadata, ContentCache};
use crate::checksum::sha1_file;
use crate::config::ShareConfig;
use crate::error::{ProtocolErrorKind, Result, ShareError};
use crate::http::HttpSource;
use crate::protocol::{
    ByteRange, FileDescriptor, HashAlgorithm, PeerId, ShareEvent, ShareId, SourceType,
    TransferProgress,
};

use bytes::Bytes;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What to download
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: ShareId,
    pub file: FileDescriptor,
    pub contributors: Vec<PeerId>,
    pub uris: Vec<String>,
    /// Only this part of the content, if set
    pub range: Option<ByteRange>,
}

/// Collaborators shared by all downloaders
#[derive(Clone)]
pub struct DownloadContext {
    pub config: Arc<ShareConfig>,
    pub http: HttpSource,
    pub peers: Arc<dyn PeerNetwork>,
    pub cache: Arc<dyn ContentCache>,
    pub events: broadcast::Sender<ShareEvent>,
    /// Cancelled on manager shutdown
    pub shutdown: CancellationToken,
}

/// Lifecycle phase of a downloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    /// Trying candidates, nothing announced yet
    Connecting,
    /// Metadata announced, bytes are flowing
    Transferring,
    /// All requested bytes are in `path`
    Finished,
    /// Every candidate failed
    Failed,
    /// Cancelled by `abort()` or shutdown
    Aborted,
}

impl DownloadPhase {
    /// No further phase change will follow
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Aborted)
    }
}

/// Observable state of a downloader
#[derive(Debug, Clone)]
pub struct DownloadSnapshot {
    pub phase: DownloadPhase,
    /// Announced by the first candidate that connected
    pub metadata: Option<TransferMetadata>,
    /// Bytes written and flushed to `path`
    pub written: u64,
    /// File holding the bytes written so far
    pub path: Option<PathBuf>,
    pub error: Option<ShareError>,
    /// Keeps a partial result's temporary file alive
    pub retained: Option<Arc<TempPath>>,
}

impl DownloadSnapshot {
    fn connecting() -> Self {
        Self {
            phase: DownloadPhase::Connecting,
            metadata: None,
            written: 0,
            path: None,
            error: None,
            retained: None,
        }
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            transferred: self.written,
            total: self.metadata.as_ref().and_then(|m| m.expected_len()),
        }
    }
}

/// Handle to a running (or finished) downloader
///
/// Cloning is cheap; all clones observe the same download. Dropping handles
/// does not stop the download, use [`abort`](Self::abort).
#[derive(Clone)]
pub struct DownloadHandle {
    id: ShareId,
    range: Option<ByteRange>,
    state: watch::Receiver<DownloadSnapshot>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("phase", &self.phase())
            .finish()
    }
}

impl DownloadHandle {
    /// Share being downloaded
    pub fn id(&self) -> &ShareId {
        &self.id
    }

    /// Range this downloader was asked for
    pub fn requested_range(&self) -> Option<ByteRange> {
        self.range
    }

    /// Current state, copied out of the watch channel
    pub fn snapshot(&self) -> DownloadSnapshot {
        self.state.borrow().clone()
    }

    /// Lifecycle phase right now
    pub fn phase(&self) -> DownloadPhase {
        self.state.borrow().phase
    }

    /// Still connecting or transferring
    pub fn is_connected(&self) -> bool {
        !self.phase().is_terminal()
    }

    /// Bytes written so far against the expected length
    pub fn progress(&self) -> TransferProgress {
        self.state.borrow().progress()
    }

    /// Whether both handles observe the same downloader
    pub fn same_download(&self, other: &DownloadHandle) -> bool {
        self.state.same_channel(&other.state)
    }

    /// Request cancellation; late completions are dropped
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Wait until a source announced what it will deliver
    pub async fn metadata_ready(&self) -> Result<TransferMetadata> {
        let mut state = self.state.clone();
        let snapshot = state
            .wait_for(|s| s.metadata.is_some() || s.phase.is_terminal())
            .await
            .map_err(|_| ShareError::Internal("downloader went away".to_string()))?;
        match (&snapshot.metadata, &snapshot.error) {
            (Some(metadata), _) => Ok(metadata.clone()),
            (None, Some(error)) => Err(error.clone()),
            (None, None) => Err(ShareError::Internal(
                "download ended without metadata".to_string(),
            )),
        }
    }

    /// Wait for the download to end, returning the file holding the content
    pub async fn wait(&self) -> Result<PathBuf> {
        let mut state = self.state.clone();
        let snapshot = state
            .wait_for(|s| s.phase.is_terminal())
            .await
            .map_err(|_| ShareError::Internal("downloader went away".to_string()))?;
        match snapshot.phase {
            DownloadPhase::Finished => snapshot
                .path
                .clone()
                .ok_or_else(|| ShareError::Internal("finished without a file".to_string())),
            _ => Err(snapshot.error.clone().unwrap_or(ShareError::Aborted)),
        }
    }

    /// Follow the downloaded bytes from the start of the transfer
    pub fn reader(&self) -> DownloadReader {
        DownloadReader::new(self.state.clone())
    }
}

/// Runs one download
pub struct SourceDownloader {
    request: DownloadRequest,
    ctx: DownloadContext,
    state: watch::Sender<DownloadSnapshot>,
    cancel: CancellationToken,
}

/// Why a candidate was given up
enum Attempt {
    /// Move on to the next candidate
    Failed(ShareError),
    /// Stop the whole download
    Cancelled,
}

impl SourceDownloader {
    /// Start downloading in a background task
    pub fn spawn(request: DownloadRequest, ctx: DownloadContext) -> DownloadHandle {
        let (tx, rx) = watch::channel(DownloadSnapshot::connecting());
        let cancel = ctx.shutdown.child_token();
        let handle = DownloadHandle {
            id: request.id.clone(),
            range: request.range,
            state: rx,
            cancel: cancel.clone(),
        };

        let downloader = SourceDownloader {
            request,
            ctx,
            state: tx,
            cancel,
        };
        tokio::spawn(downloader.run());
        handle
    }

    async fn run(self) {
        let id = self.request.id.clone();
        tracing::debug!(
            "Downloader for {} starting with {} candidate(s), range={:?}",
            id,
            self.request.uris.len(),
            self.request.range
        );

        let mut temp: Option<(tokio::fs::File, TempPath)> = None;
        let result = self.transfer(&mut temp).await;
        // Bytes already written stay readable until the last handle is gone
        let leftover = |temp: Option<(tokio::fs::File, TempPath)>| {
            temp.map(|(file, path)| {
                drop(file);
                Arc::new(path)
            })
        };
        match result {
            Ok(()) => {
                let Some((file, path)) = temp else {
                    self.fail(ShareError::Internal("no file written".to_string()), None);
                    return;
                };
                drop(file);
                if let Err(e) = self.complete(path).await {
                    self.fail(e, None);
                }
            }
            Err(ShareError::Aborted) => {
                tracing::debug!("Download of {} aborted", id);
                let retained = leftover(temp);
                self.state.send_modify(|s| {
                    s.phase = DownloadPhase::Aborted;
                    s.error = Some(ShareError::Aborted);
                    s.retained = retained;
                });
            }
            Err(e) => self.fail(e, leftover(temp)),
        }
    }

    fn fail(&self, error: ShareError, retained: Option<Arc<TempPath>>) {
        tracing::warn!("Download of {} failed: {}", self.request.id, error);
        let _ = self.ctx.events.send(ShareEvent::DownloadFailed {
            id: self.request.id.clone(),
            error: error.to_string(),
        });
        self.state.send_modify(|s| {
            s.phase = DownloadPhase::Failed;
            s.error = Some(error);
            if retained.is_some() {
                s.retained = retained;
            }
        });
    }

    /// Try candidates until one delivered everything
    async fn transfer(&self, temp: &mut Option<(tokio::fs::File, TempPath)>) -> Result<()> {
        let mut queue = CandidateQueue::new(&self.request.uris);
        if queue.is_empty() {
            return Err(ShareError::configuration("Download sources are not given"));
        }

        let mut last_error = None;
        while let Some((uri, kind)) = queue.next_candidate() {
            match self.attempt(&uri, kind, temp).await {
                Ok(()) => return Ok(()),
                Err(Attempt::Cancelled) => return Err(ShareError::Aborted),
                Err(Attempt::Failed(error)) => {
                    let _ = self.ctx.events.send(ShareEvent::CandidateFailed {
                        id: self.request.id.clone(),
                        uri: uri.clone(),
                        error: error.to_string(),
                    });
                    queue.report_failure(error.to_string());
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ShareError::configuration("Download sources are not given")))
    }

    /// Range to ask the next candidate for
    fn next_range(&self) -> Option<ByteRange> {
        let state = self.state.borrow();
        let Some(ref metadata) = state.metadata else {
            return self.request.range;
        };
        match metadata.range {
            Some(range) => Some(range.skip(state.written)),
            None if state.written == 0 => None,
            None => Some(ByteRange {
                start: state.written,
                size: metadata
                    .total_size
                    .map(|total| total.saturating_sub(state.written)),
            }),
        }
    }

    async fn open(
        &self,
        uri: &str,
        kind: SourceType,
        range: Option<ByteRange>,
    ) -> Result<OpenedTransfer> {
        match kind {
            SourceType::Http | SourceType::Ftp => self.ctx.http.open(uri, range).await,
            SourceType::Bob => {
                peer::open_bob(self.ctx.peers.as_ref(), &self.request.contributors, uri).await
            }
            SourceType::Jingle => {
                peer::open_jingle(
                    self.ctx.peers.as_ref(),
                    &self.request.contributors,
                    uri,
                    &self.request.file,
                    range,
                )
                .await
            }
            SourceType::None => Err(ShareError::protocol(
                ProtocolErrorKind::UnsupportedScheme,
                format!("No retrieval strategy for {}", uri),
            )),
        }
    }

    /// Check what a freshly opened candidate offers against what we need
    fn accept(&self, wanted: Option<ByteRange>, offered: &TransferMetadata) -> Result<()> {
        let state = self.state.borrow();
        if state.metadata.is_some() {
            // Resuming: only the exact continuation is any good
            if let Some(wanted) = wanted {
                if offered.range.map(|r| r.start) != Some(wanted.start) {
                    return Err(ShareError::protocol(
                        ProtocolErrorKind::RangeNotSupported,
                        format!("source can't resume at byte {}", wanted.start),
                    ));
                }
            }
            return Ok(());
        }

        if let Some(wanted) = wanted {
            if let Some(got) = offered.range.filter(|got| got.start != wanted.start) {
                return Err(ShareError::protocol(
                    ProtocolErrorKind::InvalidResponse,
                    format!("asked for byte {}, source sent {}", wanted.start, got.start),
                ));
            }
            // Without ranging nor a size there is no telling where the tail starts
            if wanted.is_open_ended() && offered.range.is_none() && offered.total_size.is_none()
            {
                return Err(ShareError::SizeUnknown(format!(
                    "open-ended range from byte {} of content with unknown size",
                    wanted.start
                )));
            }
        }
        Ok(())
    }

    async fn attempt(
        &self,
        uri: &str,
        kind: SourceType,
        temp: &mut Option<(tokio::fs::File, TempPath)>,
    ) -> std::result::Result<(), Attempt> {
        let wanted = self.next_range();
        tracing::debug!(
            "Trying {} source {} for {} (range={:?})",
            kind,
            uri,
            self.request.id,
            wanted
        );

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Attempt::Cancelled),
            opened = self.open(uri, kind, wanted) => opened.map_err(Attempt::Failed)?,
        };
        self.accept(wanted, &opened.metadata)
            .map_err(Attempt::Failed)?;

        if temp.is_none() {
            *temp = Some(self.create_temp().await.map_err(Attempt::Failed)?);
        }
        let Some((file, path)) = temp.as_mut() else {
            return Err(Attempt::Failed(ShareError::Internal(
                "temporary file missing".to_string(),
            )));
        };

        let temp_path = path.to_path_buf();
        self.state.send_if_modified(|s| {
            if s.metadata.is_some() {
                return false;
            }
            tracing::debug!(
                "{} metadata: range={:?} total={:?} type={:?}",
                self.request.id,
                opened.metadata.range,
                opened.metadata.total_size,
                opened.metadata.media_type
            );
            let announced = opened.metadata.clone();
            s.metadata = Some(match wanted {
                Some(wanted) => announced.narrowed_to(wanted),
                None => announced,
            });
            s.phase = DownloadPhase::Transferring;
            s.path = Some(temp_path.clone());
            true
        });

        let expected = self
            .state
            .borrow()
            .metadata
            .as_ref()
            .and_then(|m| m.expected_len());
        self.stream_body(opened.body, file, expected).await
    }

    /// Copy a body into the temporary file
    async fn stream_body(
        &self,
        mut body: ByteStream,
        file: &mut tokio::fs::File,
        expected: Option<u64>,
    ) -> std::result::Result<(), Attempt> {
        let _guard = crate::http::connection::ConnectionGuard::new(self.ctx.http.pool());
        let interval = self.ctx.config.progress_interval_duration();
        let mut last_update = Instant::now();

        loop {
            let written = self.state.borrow().written;
            if expected.is_some_and(|total| written >= total) {
                break;
            }

            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => {
                    file.flush().await.ok();
                    return Err(Attempt::Cancelled);
                }
                chunk = body.next() => chunk,
            };
            let mut chunk: Bytes = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(Attempt::Failed(e)),
                None => break,
            };

            if let Some(total) = expected {
                let room = total.saturating_sub(written);
                if chunk.len() as u64 > room {
                    chunk.truncate(room as usize);
                }
            }
            let chunk_len = chunk.len() as u64;
            self.ctx.http.pool().acquire_download(chunk_len).await;

            file.write_all(&chunk)
                .await
                .map_err(|e| Attempt::Failed(e.into()))?;
            file.flush().await.map_err(|e| Attempt::Failed(e.into()))?;
            self.ctx.http.pool().record_download(chunk_len);

            // Readers may only see bytes that reached the file
            self.state.send_modify(|s| s.written += chunk_len);

            if last_update.elapsed() >= interval {
                last_update = Instant::now();
                self.emit_progress();
            }
        }

        let written = self.state.borrow().written;
        if let Some(total) = expected {
            if written < total {
                return Err(Attempt::Failed(ShareError::protocol(
                    ProtocolErrorKind::InvalidResponse,
                    format!("source ended after {} of {} bytes", written, total),
                )));
            }
        }
        self.emit_progress();
        Ok(())
    }

    fn emit_progress(&self) {
        let progress = self.state.borrow().progress();
        let _ = self.ctx.events.send(ShareEvent::Progress {
            id: self.request.id.clone(),
            progress,
        });
    }

    async fn create_temp(&self) -> Result<(tokio::fs::File, TempPath)> {
        let dir = self.ctx.config.documents_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<(tokio::fs::File, TempPath)> {
            let named = tempfile::Builder::new()
                .prefix("dl-")
                .tempfile_in(&dir)
                .map_err(|e| ShareError::from(e).at_path(&dir))?;
            let (file, path) = named.into_parts();
            Ok((tokio::fs::File::from_std(file), path))
        })
        .await?
    }

    /// Settle a successful transfer
    async fn complete(&self, temp: TempPath) -> Result<()> {
        let whole = self
            .state
            .borrow()
            .metadata
            .as_ref()
            .is_some_and(|m| m.range.is_none());

        if !whole {
            let retained = Arc::new(temp);
            let path = retained.to_path_buf();
            tracing::debug!("Partial download of {} ready at {:?}", self.request.id, path);
            self.state.send_modify(|s| {
                s.phase = DownloadPhase::Finished;
                s.path = Some(path);
                s.retained = Some(retained);
            });
            return Ok(());
        }

        let hash = match self.request.file.hash(HashAlgorithm::Sha1) {
            Some(known) => ShareId::from_digest(&known.value),
            None => sha1_file(&temp).await?,
        };

        let name = self
            .request
            .file
            .name
            .as_deref()
            .and_then(naming::clean_file_name)
            .unwrap_or_else(|| self.request.id.to_string());
        let dir = self.ctx.config.documents_dir.clone();
        let destination = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            let mut temp = temp;
            loop {
                let destination = naming::unique_destination(&dir, &name);
                match temp.persist_noclobber(&destination) {
                    Ok(()) => return Ok(destination),
                    Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                        // Somebody took the name meanwhile
                        temp = e.path;
                    }
                    Err(e) => return Err(ShareError::from(e.error).at_path(&destination)),
                }
            }
        })
        .await??;

        let file = &self.request.file;
        let announced = self.state.borrow().metadata.clone().unwrap_or_default();
        let mut metadata = CacheMetadata {
            media_type: file.media_type.clone().or(announced.media_type),
            uris: self.request.uris.clone(),
            link: Some(destination.clone()),
            thumbnail: file.thumbnail.as_ref().map(|t| t.uri.clone()),
            ..Default::default()
        };
        metadata.set_spectrum(&file.spectrum);
        self.ctx
            .cache
            .append(&hash, Bytes::new(), metadata, self.ctx.config.file_ttl)
            .await?;

        tracing::info!("Downloaded {} to {:?}", self.request.id, destination);
        self.state.send_modify(|s| {
            s.phase = DownloadPhase::Finished;
            s.path = Some(destination.clone());
        });
        let _ = self.ctx.events.send(ShareEvent::DownloadCompleted {
            id: self.request.id.clone(),
            path: destination,
        });
        Ok(())
    }
}
