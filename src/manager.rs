//! Share manager
//!
//! The manager is the entry point of the crate. It owns the content cache,
//! the source registry and the network plumbing, and coordinates:
//! - Publishing local files, images and voice clips
//! - Registering remote shares and downloading them
//! - Serving shares through the range proxy, in-process or over TCP

use crate::cache::{CacheEntry, CacheMetadata, ContentCache, FileCache};
use crate::config::ShareConfig;
use crate::download::{
    DownloadContext, DownloadHandle, DownloadRequest, OfflinePeers, PeerNetwork,
    SourceDownloader,
};
use crate::error::{Result, ShareError};
use crate::http::HttpSource;
use crate::protocol::{ByteRange, FileDescriptor, PeerId, ShareEvent, ShareId};
use crate::proxy::{spawn_reply, ProxyContext, ProxyReply, ProxyRequest, ShareServer};
use crate::registry::{Source, SourceRegistry};
use crate::share::{NoUploader, PublishContext, ShareItem, Uploader};

use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::ToSocketAddrs;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Event channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Pluggable collaborators of a manager
pub struct Backends {
    /// Content cache; a [`FileCache`] in the configured cache directory
    /// when `None`
    pub cache: Option<Arc<dyn ContentCache>>,
    pub peers: Arc<dyn PeerNetwork>,
    pub uploader: Arc<dyn Uploader>,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            cache: None,
            peers: Arc::new(OfflinePeers),
            uploader: Arc::new(NoUploader),
        }
    }
}

/// Coordinates caching, publishing, downloading and proxying of shares
pub struct ShareManager {
    config: Arc<ShareConfig>,
    cache: Arc<dyn ContentCache>,
    registry: Arc<SourceRegistry>,
    uploader: Arc<dyn Uploader>,
    downloads: DownloadContext,
    event_tx: broadcast::Sender<ShareEvent>,
    shutdown: CancellationToken,
}

impl ShareManager {
    /// Create a manager with the default backends
    pub async fn new(config: ShareConfig) -> Result<Arc<Self>> {
        Self::with_backends(config, Backends::default()).await
    }

    /// Create a manager with the given backends
    pub async fn with_backends(config: ShareConfig, backends: Backends) -> Result<Arc<Self>> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.cache_dir)
            .await
            .map_err(|e| ShareError::from(e).at_path(&config.cache_dir))?;

        let cache: Arc<dyn ContentCache> = match backends.cache {
            Some(cache) => cache,
            None => Arc::new(FileCache::new(&config.cache_dir, config.get_database_path()).await?),
        };

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let http = HttpSource::new(&config)?;
        let config = Arc::new(config);

        let downloads = DownloadContext {
            config: Arc::clone(&config),
            http,
            peers: backends.peers,
            cache: Arc::clone(&cache),
            events: event_tx.clone(),
            shutdown: shutdown.clone(),
        };

        tracing::info!(
            "Share manager ready: cache={:?} documents={:?}",
            config.cache_dir,
            config.documents_dir
        );

        Ok(Arc::new(Self {
            registry: SourceRegistry::new(event_tx.clone()),
            config,
            cache,
            uploader: backends.uploader,
            downloads,
            event_tx,
            shutdown,
        }))
    }

    pub fn config(&self) -> &ShareConfig {
        &self.config
    }

    /// Subscribe to share events
    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.event_tx.subscribe()
    }

    /// Shares cache directory, created if missing
    pub async fn cache_dir(&self) -> Result<PathBuf> {
        let dir = &self.config.cache_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ShareError::from(e).at_path(dir))?;
        Ok(dir.clone())
    }

    // ---- Content cache ----

    pub async fn cache_item(&self, id: &ShareId, reborn: bool) -> Result<Option<CacheEntry>> {
        self.cache.get(id, reborn).await
    }

    pub async fn save_to_cache(
        &self,
        id: &ShareId,
        data: Bytes,
        metadata: CacheMetadata,
        ttl: u64,
    ) -> Result<CacheEntry> {
        self.cache.append(id, data, metadata, ttl).await
    }

    /// Drop expired cache entries
    pub async fn purge_expired(&self) -> Result<usize> {
        self.cache.purge_expired().await
    }

    // ---- Publishing ----

    pub async fn share_file(&self, path: impl AsRef<Path>) -> Result<ShareItem> {
        ShareItem::from_file(path, self.cache.as_ref()).await
    }

    /// Items for every readable regular file among `paths`
    pub async fn share_files<P: AsRef<Path>>(&self, paths: &[P]) -> Vec<ShareItem> {
        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            match ShareItem::from_file(path, self.cache.as_ref()).await {
                Ok(item) => items.push(item),
                Err(e) => tracing::debug!("Skipping {}: {}", path.display(), e),
            }
        }
        items
    }

    pub async fn share_bytes(
        &self,
        media_type: impl Into<String>,
        data: Bytes,
        extra: BTreeMap<String, String>,
    ) -> Result<ShareItem> {
        ShareItem::from_bytes(
            media_type,
            data,
            extra,
            self.cache.as_ref(),
            &self.config.temp_dir,
        )
        .await
    }

    /// Share an encoded PNG image
    pub async fn share_image(&self, png: Bytes) -> Result<ShareItem> {
        ShareItem::from_image(png, self.cache.as_ref(), &self.config.temp_dir).await
    }

    /// Share a voice clip along with its amplitude histogram
    pub async fn share_voice(&self, ogg: Bytes, histogram: impl Into<String>) -> Result<ShareItem> {
        let extra = BTreeMap::from([("histogram".to_string(), histogram.into())]);
        self.share_bytes("audio/ogg", ogg, extra).await
    }

    pub fn item_from_cache(&self, entry: CacheEntry) -> ShareItem {
        ShareItem::from_cache(entry)
    }

    /// Publish `item` on every transport
    pub async fn publish(&self, item: &mut ShareItem) -> Result<()> {
        item.publish(&self.publish_context()).await
    }

    pub fn publish_context(&self) -> PublishContext {
        PublishContext {
            uploader: Arc::clone(&self.uploader),
            cache: Arc::clone(&self.cache),
            events: self.event_tx.clone(),
            file_ttl: self.config.file_ttl,
            temp_ttl: self.config.temp_ttl,
        }
    }

    // ---- Remote sources ----

    pub fn register_source(
        &self,
        file: &FileDescriptor,
        contributor: Option<PeerId>,
        uris: &[String],
    ) -> Result<ShareId> {
        self.registry.register_source(file, contributor, uris)
    }

    pub fn source(&self, id: &ShareId) -> Option<Source> {
        self.registry.get(id)
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// URL a media backend can fetch directly, bypassing the downloader
    pub fn simple_source(&self, id: &ShareId) -> Option<url::Url> {
        self.registry.simple_source(id)
    }

    /// The shared downloader of a source, started if needed
    pub fn download_share(&self, id: &ShareId) -> Result<DownloadHandle> {
        self.registry.download_share(id, &self.downloads)
    }

    /// A dedicated downloader for part of a source
    ///
    /// Not shared with other consumers. The result is only cached when the
    /// source ignores the range and delivers the whole content.
    pub fn download_range(&self, id: &ShareId, range: ByteRange) -> Result<DownloadHandle> {
        let source = self
            .registry
            .get(id)
            .ok_or_else(|| ShareError::NotFound(format!("share {}", id)))?;
        if source.uris.is_empty() {
            return Err(ShareError::configuration("Download sources are not given"));
        }
        let request = DownloadRequest {
            id: source.id,
            file: source.file,
            contributors: source.contributors,
            uris: source.uris,
            range: Some(range),
        };
        Ok(SourceDownloader::spawn(request, self.downloads.clone()))
    }

    /// Local files for a peer's download request, if all are cached
    ///
    /// `None` means the request can't be accepted without asking the user:
    /// some descriptor carries no hash or its content isn't cached.
    pub async fn resolve_incoming_request(
        &self,
        files: &[FileDescriptor],
    ) -> Result<Option<Vec<PathBuf>>> {
        let mut paths = Vec::with_capacity(files.len());
        for file in files {
            let Some(id) = file.share_id() else {
                return Ok(None);
            };
            let Some(entry) = self.cache.get(&id, true).await? else {
                tracing::debug!("Incoming request for uncached {}", id);
                return Ok(None);
            };
            paths.push(entry.file_path());
        }
        Ok(Some(paths))
    }

    // ---- Proxy ----

    pub fn proxy_context(&self) -> ProxyContext {
        ProxyContext {
            registry: Arc::clone(&self.registry),
            cache: Arc::clone(&self.cache),
            downloads: self.downloads.clone(),
            chunk_size: self.config.proxy.chunk_size,
        }
    }

    /// Serve a share as an in-process reply
    pub fn proxify(&self, id: &ShareId, range_header: Option<&str>) -> ProxyReply {
        let request = ProxyRequest {
            id: id.clone(),
            range: range_header.map(str::to_string),
        };
        spawn_reply(self.proxy_context(), request, self.config.proxy.reply_buffer)
    }

    /// Serve shares over HTTP on `addr`
    pub async fn serve(&self, addr: impl ToSocketAddrs) -> Result<ShareServer> {
        ShareServer::bind(
            addr,
            self.proxy_context(),
            &self.config.proxy.path_prefix,
            self.config.proxy.reply_buffer,
            self.shutdown.child_token(),
        )
        .await
    }

    /// Abort in-flight downloads and stop servers
    pub fn shutdown(&self) {
        tracing::info!("Share manager shutting down");
        self.registry.abort_all();
        self.shutdown.cancel();
    }
}
