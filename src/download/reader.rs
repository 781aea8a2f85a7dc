//! Following a download while it grows
//!
//! A reader only ever sees bytes the downloader already flushed to disk, so
//! any number of consumers can tail one transfer at their own pace.

use super::{ByteStream, DownloadPhase, DownloadSnapshot};
use crate::error::{Result, ShareError};
use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;

/// Sequential reader over a downloader's output
pub struct DownloadReader {
    state: watch::Receiver<DownloadSnapshot>,
    file: Option<tokio::fs::File>,
    offset: u64,
    /// Keeps a partial result on disk while we read it
    retained: Option<Arc<TempPath>>,
}

impl DownloadReader {
    pub(crate) fn new(state: watch::Receiver<DownloadSnapshot>) -> Self {
        Self {
            state,
            file: None,
            offset: 0,
            retained: None,
        }
    }

    /// Bytes handed out so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Skip `n` bytes that have not been read yet
    pub fn skip(&mut self, n: u64) {
        self.offset += n;
        self.file = None;
    }

    /// Wait for the next update; once the downloader is gone, its last
    /// recorded error (if any) is what the reader reports
    async fn changed(&mut self) -> Result<()> {
        if self.state.changed().await.is_ok() {
            return Ok(());
        }
        Err(self
            .state
            .borrow()
            .error
            .clone()
            .unwrap_or_else(|| ShareError::Internal("downloader went away".to_string())))
    }

    /// Next chunk of at most `max` bytes
    ///
    /// Waits while the downloader is behind. `Ok(None)` means the download
    /// finished and everything was read; a failed or aborted download
    /// reports its error once the written bytes are drained.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>> {
        let max = max.max(1) as u64;
        loop {
            let (written, phase, path, error) = {
                let snapshot = self.state.borrow_and_update();
                if self.retained.is_none() {
                    self.retained = snapshot.retained.clone();
                }
                (
                    snapshot.written,
                    snapshot.phase,
                    snapshot.path.clone(),
                    snapshot.error.clone(),
                )
            };

            if written > self.offset {
                if self.file.is_none() {
                    let Some(path) = path else {
                        return Err(ShareError::Internal(
                            "bytes written without a file".to_string(),
                        ));
                    };
                    match tokio::fs::File::open(&path).await {
                        Ok(mut file) => {
                            file.seek(SeekFrom::Start(self.offset))
                                .await
                                .map_err(|e| ShareError::from(e).at_path(&path))?;
                            self.file = Some(file);
                        }
                        // Renamed into place meanwhile
                        Err(e)
                            if e.kind() == std::io::ErrorKind::NotFound
                                && !phase.is_terminal() =>
                        {
                            self.changed().await?;
                            continue;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            return Err(error
                                .unwrap_or_else(|| ShareError::from(e).at_path(&path)))
                        }
                        Err(e) => return Err(ShareError::from(e).at_path(&path)),
                    }
                }

                let len = (written - self.offset).min(max) as usize;
                let mut buf = BytesMut::zeroed(len);
                if let Some(file) = self.file.as_mut() {
                    file.read_exact(&mut buf).await?;
                }
                self.offset += len as u64;
                return Ok(Some(buf.freeze()));
            }

            match phase {
                DownloadPhase::Finished => return Ok(None),
                DownloadPhase::Failed | DownloadPhase::Aborted => {
                    return Err(error.unwrap_or(ShareError::Aborted))
                }
                DownloadPhase::Connecting | DownloadPhase::Transferring => {
                    self.changed().await?
                }
            }
        }
    }

    /// Turn the reader into a stream of chunks of at most `chunk_size` bytes
    pub fn into_stream(self, chunk_size: usize) -> ByteStream {
        Box::pin(futures::stream::try_unfold(self, move |mut reader| async move {
            let chunk = reader.read_chunk(chunk_size).await?;
            Ok::<_, ShareError>(chunk.map(|chunk| (chunk, reader)))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn snapshot(phase: DownloadPhase, written: u64, path: Option<std::path::PathBuf>) -> DownloadSnapshot {
        DownloadSnapshot {
            phase,
            metadata: None,
            written,
            path,
            error: None,
            retained: None,
        }
    }

    #[tokio::test]
    async fn test_reader_follows_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("growing");
        let mut file = std::fs::File::create(&path).unwrap();

        let (tx, rx) = watch::channel(snapshot(DownloadPhase::Connecting, 0, None));
        let mut reader = DownloadReader::new(rx);

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for part in [&b"hello "[..], b"world"] {
                file.write_all(part).unwrap();
                file.flush().unwrap();
                tx.send_modify(|s| {
                    s.phase = DownloadPhase::Transferring;
                    s.path = Some(writer_path.clone());
                    s.written += part.len() as u64;
                });
                tokio::task::yield_now().await;
            }
            tx.send_modify(|s| s.phase = DownloadPhase::Finished);
            tx
        });

        let mut out = Vec::new();
        while let Some(chunk) = reader.read_chunk(4).await.unwrap() {
            assert!(chunk.len() <= 4);
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello world");
        assert_eq!(reader.offset(), 11);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_reader_reports_failure_after_drain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial");
        std::fs::write(&path, b"abc").unwrap();

        let mut failed = snapshot(DownloadPhase::Failed, 3, Some(path));
        failed.error = Some(ShareError::configuration("Download sources are not given"));
        let (_tx, rx) = watch::channel(failed);

        let mut reader = DownloadReader::new(rx);
        assert_eq!(&reader.read_chunk(16).await.unwrap().unwrap()[..], b"abc");
        let err = reader.read_chunk(16).await.unwrap_err();
        assert!(matches!(err, ShareError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_reader_reports_failure_when_file_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-there");

        let mut failed = snapshot(DownloadPhase::Failed, 5, Some(path));
        failed.error = Some(ShareError::network(
            crate::error::NetworkErrorKind::ConnectionReset,
            "peer went away",
        ));
        let (tx, rx) = watch::channel(failed);
        drop(tx);

        let mut reader = DownloadReader::new(rx);
        let err = reader.read_chunk(16).await.unwrap_err();
        assert!(matches!(
            err,
            ShareError::Network {
                kind: crate::error::NetworkErrorKind::ConnectionReset,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_reader_reports_error_after_downloader_exit() {
        let (tx, rx) = watch::channel(snapshot(DownloadPhase::Connecting, 0, None));
        let mut reader = DownloadReader::new(rx);
        let pending = tokio::spawn(async move { reader.read_chunk(16).await });

        tokio::task::yield_now().await;
        tx.send_modify(|s| s.error = Some(ShareError::configuration("no usable URI")));
        drop(tx);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ShareError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_reader_skip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done");
        std::fs::write(&path, b"0123456789").unwrap();
        let (_tx, rx) = watch::channel(snapshot(DownloadPhase::Finished, 10, Some(path)));

        let mut reader = DownloadReader::new(rx);
        reader.skip(7);
        let chunks: Vec<Bytes> = futures::TryStreamExt::try_collect(reader.into_stream(2))
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"789");
    }
}
