//! Shareable items
//!
//! Construction hashes the content eagerly and looks it up in the cache, so
//! content that was already published is not published again. In-memory
//! payloads are spilled into a `share-*` temporary file that is removed
//! unless the item ends up cached.

use super::{mime, Uploader};
use crate::cache::{CacheEntry, CacheMetadata, ContentCache};
use crate::checksum::{sha1_bytes, sha1_file};
use crate::error::{Result, ShareError};
use crate::protocol::{
    sort_by_priority, FileDescriptor, FileHash, MediaShare, PeerId, ShareEvent, ShareId,
    TransferProgress,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::sync::broadcast;

/// Collaborators needed to publish an item
#[derive(Clone)]
pub struct PublishContext {
    pub uploader: Arc<dyn Uploader>,
    pub cache: Arc<dyn ContentCache>,
    pub events: broadcast::Sender<ShareEvent>,
    /// TTL for items linking to user-owned files
    pub file_ttl: u64,
    /// TTL for items whose payload is stored in the cache
    pub temp_ttl: u64,
}

/// A transport that finished
enum Transport {
    Http(Result<String>),
    Jingle,
}

/// One piece of content being shared
#[derive(Debug)]
pub struct ShareItem {
    id: ShareId,
    path: PathBuf,
    /// Backing file we created and own
    temp: Option<TempPath>,
    temporary: bool,
    size: u64,
    media_type: String,
    modified: Option<DateTime<Utc>>,
    description: Option<String>,
    /// Extra metadata stored with the cache entry
    extra: BTreeMap<String, String>,
    ready_uris: Vec<String>,
    http_finished: bool,
    jingle_finished: bool,
    finish_notified: bool,
    cached: Option<CacheEntry>,
}

impl ShareItem {
    /// Item for content that is already cached
    pub fn from_cache(entry: CacheEntry) -> Self {
        let ready_uris = entry.metadata.uris.clone();
        let http_finished = ready_uris.iter().any(|u| u.starts_with("http"));
        let jingle_finished = ready_uris.iter().any(|u| {
            url::Url::parse(u).is_ok_and(|url| url.scheme() == "xmpp")
        });
        let path = entry.file_path();
        Self {
            id: entry.id.clone(),
            media_type: entry
                .metadata
                .media_type
                .clone()
                .unwrap_or_else(|| mime::from_path(&path).to_string()),
            path,
            temp: None,
            temporary: false,
            size: entry.size,
            modified: Some(entry.created_at),
            description: None,
            extra: entry.metadata.extra.clone(),
            ready_uris,
            http_finished,
            jingle_finished,
            finish_notified: false,
            cached: Some(entry),
        }
    }

    /// Item for a user-owned file
    pub async fn from_file(path: impl AsRef<Path>, cache: &dyn ContentCache) -> Result<Self> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| ShareError::from(e).at_path(path))?;
        if !meta.is_file() {
            return Err(ShareError::invalid_input(
                "path",
                format!("{} is not a regular file", path.display()),
            ));
        }

        let id = sha1_file(path).await?;
        if let Some(entry) = cache.get(&id, true).await? {
            tracing::debug!("{} is already shared as {}", path.display(), id);
            return Ok(Self::from_cache(entry));
        }

        Ok(Self {
            id,
            path: path.to_path_buf(),
            temp: None,
            temporary: false,
            size: meta.len(),
            media_type: mime::from_path(path).to_string(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            description: None,
            extra: BTreeMap::new(),
            ready_uris: Vec::new(),
            http_finished: false,
            jingle_finished: false,
            finish_notified: false,
            cached: None,
        })
    }

    /// Item for an in-memory payload
    pub async fn from_bytes(
        media_type: impl Into<String>,
        data: Bytes,
        extra: BTreeMap<String, String>,
        cache: &dyn ContentCache,
        temp_dir: &Path,
    ) -> Result<Self> {
        let id = sha1_bytes(&data);
        if let Some(entry) = cache.get(&id, true).await? {
            let mut item = Self::from_cache(entry);
            item.extra.extend(extra);
            return Ok(item);
        }

        let dir = temp_dir.to_path_buf();
        let payload = data.clone();
        let temp = tokio::task::spawn_blocking(move || -> Result<TempPath> {
            let mut file = tempfile::Builder::new()
                .prefix("share-")
                .tempfile_in(&dir)
                .map_err(|e| ShareError::from(e).at_path(&dir))?;
            file.write_all(&payload)?;
            file.flush()?;
            Ok(file.into_temp_path())
        })
        .await??;

        Ok(Self {
            id,
            path: temp.to_path_buf(),
            temp: Some(temp),
            temporary: true,
            size: data.len() as u64,
            media_type: media_type.into(),
            modified: Some(Utc::now()),
            description: None,
            extra,
            ready_uris: Vec::new(),
            http_finished: false,
            jingle_finished: false,
            finish_notified: false,
            cached: None,
        })
    }

    /// Item for an encoded PNG image
    pub async fn from_image(png: Bytes, cache: &dyn ContentCache, temp_dir: &Path) -> Result<Self> {
        Self::from_bytes("image/png", png, BTreeMap::new(), cache, temp_dir).await
    }

    pub fn id(&self) -> &ShareId {
        &self.id
    }

    /// File holding the content
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn is_image(&self) -> bool {
        mime::is_image(&self.media_type)
    }

    /// Whether the content lives in a file this item created
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.extra
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    /// URIs the content was published at
    pub fn ready_uris(&self) -> &[String] {
        &self.ready_uris
    }

    /// Whether every transport finished and the item was announced
    pub fn is_published(&self) -> bool {
        self.finish_notified
    }

    pub fn cache_entry(&self) -> Option<&CacheEntry> {
        self.cached.as_ref()
    }

    /// Name to publish the content under
    pub fn display_name(&self) -> String {
        if self.temporary {
            return format!("share-{}.{}", self.id, mime::extension_for(&self.media_type));
        }
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Publish on every transport not done yet
    ///
    /// The network upload and the peer-to-peer transport finish
    /// independently; the item is cached and `PublishFinished` is emitted
    /// once, after the last of them.
    pub async fn publish(&mut self, ctx: &PublishContext) -> Result<()> {
        let mut transports: FuturesUnordered<BoxFuture<'static, Transport>> =
            FuturesUnordered::new();

        if !self.http_finished {
            let uploader = Arc::clone(&ctx.uploader);
            let path = self.path.clone();
            let name = self.display_name();
            let media_type = self.media_type.clone();
            let events = ctx.events.clone();
            let id = self.id.clone();
            transports.push(
                async move {
                    let progress = move |progress: TransferProgress| {
                        let _ = events.send(ShareEvent::PublishProgress {
                            id: id.clone(),
                            progress,
                        });
                    };
                    Transport::Http(uploader.upload(&path, &name, &media_type, &progress).await)
                }
                .boxed(),
            );
        }
        if !self.jingle_finished {
            // Peer-to-peer retrieval needs no preparation
            transports.push(async { Transport::Jingle }.boxed());
        }

        if transports.is_empty() && !self.finish_notified {
            // Published before and already cached
            self.finish_notified = true;
            self.notify_finished(ctx);
            return Ok(());
        }

        while let Some(done) = transports.next().await {
            match done {
                Transport::Http(Ok(url)) => {
                    tracing::debug!("{} uploaded to {}", self.id, url);
                    self.ready_uris.push(url);
                    self.http_finished = true;
                }
                Transport::Http(Err(e)) => {
                    tracing::warn!("Upload of {} failed: {}", self.id, e);
                    self.http_finished = true;
                }
                Transport::Jingle => self.jingle_finished = true,
            }
            self.check_finished(ctx).await?;
        }
        Ok(())
    }

    async fn check_finished(&mut self, ctx: &PublishContext) -> Result<()> {
        if self.finish_notified || !self.http_finished || !self.jingle_finished {
            return Ok(());
        }

        let mut metadata = CacheMetadata {
            media_type: Some(self.media_type.clone()),
            uris: self.ready_uris.clone(),
            extra: self.extra.clone(),
            ..Default::default()
        };
        let entry = if let Some(ref temp) = self.temp {
            let data = tokio::fs::read(temp)
                .await
                .map_err(|e| ShareError::from(e).at_path(&self.path))?;
            let entry = ctx
                .cache
                .append(&self.id, Bytes::from(data), metadata, ctx.temp_ttl)
                .await?;
            // The cache holds its own copy now
            self.temp = None;
            entry
        } else {
            metadata.link = Some(self.path.clone());
            ctx.cache
                .append(&self.id, Bytes::new(), metadata, ctx.file_ttl)
                .await?
        };

        self.path = entry.file_path();
        self.cached = Some(entry);
        self.finish_notified = true;
        self.notify_finished(ctx);
        Ok(())
    }

    fn notify_finished(&self, ctx: &PublishContext) {
        tracing::info!("{} published at {:?}", self.id, self.ready_uris);
        let _ = ctx.events.send(ShareEvent::PublishFinished {
            id: self.id.clone(),
            uris: self.ready_uris.clone(),
        });
    }

    /// Reference to send to other peers
    ///
    /// Adds our own peer-to-peer URI; `None` while our own resource is
    /// unknown.
    pub fn to_reference(&self, self_peer: &PeerId) -> Option<MediaShare> {
        self_peer.resource()?;

        let mut uris = self.ready_uris.clone();
        uris.push(format!("xmpp:{}?jingle-ft", self_peer));
        let mut sources = sort_by_priority(&uris);
        sources.reverse();

        let mut file = FileDescriptor::new(self.display_name())
            .with_size(self.size)
            .with_media_type(self.media_type.clone())
            .with_hash(FileHash::sha1(hex::decode(self.id.as_str()).unwrap_or_default()));
        file.date = self.modified;
        file.description = self.description.clone();

        Some(MediaShare { file, sources })
    }
}
