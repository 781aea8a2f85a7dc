//! Source registry
//!
//! In-memory table of everything known about remotely shared content: the
//! file descriptor, who can supply it, where it can be fetched from and
//! whether it is being (or has been) downloaded.

use crate::download::{DownloadContext, DownloadHandle, DownloadPhase, DownloadRequest, SourceDownloader};
use crate::error::{Result, ShareError};
use crate::protocol::{
    sort_by_priority, FileDescriptor, PeerId, ShareEvent, ShareId, SourceState, SourceType,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// Everything known about one piece of remote content
#[derive(Debug, Clone)]
pub struct Source {
    pub id: ShareId,
    pub file: FileDescriptor,
    /// Peers that announced the content
    pub contributors: Vec<PeerId>,
    /// Retrieval URIs in registration order
    pub uris: Vec<String>,
    pub state: SourceState,
    downloader: Option<DownloadHandle>,
}

impl Source {
    fn new(id: ShareId, file: FileDescriptor, contributor: Option<PeerId>, uris: &[String]) -> Self {
        let mut source = Self {
            id,
            file,
            contributors: contributor.into_iter().collect(),
            uris: Vec::with_capacity(uris.len()),
            state: SourceState::None,
            downloader: None,
        };
        source.add_uris(uris);
        source
    }

    fn add_uris(&mut self, uris: &[String]) {
        for uri in uris {
            if !self.uris.contains(uri) {
                self.uris.push(uri.clone());
            }
        }
    }

    /// The in-flight downloader, if any
    pub fn downloader(&self) -> Option<&DownloadHandle> {
        self.downloader.as_ref()
    }
}

/// Share id to source table
pub struct SourceRegistry {
    /// Weak self-reference for the per-downloader watch tasks
    self_ref: Weak<Self>,
    sources: RwLock<HashMap<ShareId, Source>>,
    events: broadcast::Sender<ShareEvent>,
}

impl SourceRegistry {
    pub fn new(events: broadcast::Sender<ShareEvent>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            sources: RwLock::new(HashMap::new()),
            events,
        })
    }

    /// Record that `contributor` offers `file` at `uris`
    ///
    /// The share id is the descriptor's SHA-1 (or first) hash. Known ids get
    /// the descriptor merged and the URI/contributor sets extended; a
    /// descriptor that contradicts the known one replaces it.
    pub fn register_source(
        &self,
        file: &FileDescriptor,
        contributor: Option<PeerId>,
        uris: &[String],
    ) -> Result<ShareId> {
        let id = file
            .share_id()
            .ok_or_else(|| ShareError::invalid_input("file", "descriptor carries no hash"))?;

        let mut sources = self.sources.write();
        match sources.get_mut(&id) {
            None => {
                sources.insert(
                    id.clone(),
                    Source::new(id.clone(), file.clone(), contributor, uris),
                );
            }
            Some(source) => {
                if source.file.merge(file) {
                    if let Some(contributor) = contributor {
                        if !source.contributors.contains(&contributor) {
                            source.contributors.push(contributor);
                        }
                    }
                    source.add_uris(uris);
                } else {
                    tracing::debug!("Conflicting descriptor for {}, replacing source", id);
                    let mut replacement =
                        Source::new(id.clone(), file.clone(), contributor, uris);
                    // An in-flight downloader stays the only one for this id
                    replacement.state = source.state;
                    replacement.downloader = source.downloader.take();
                    *source = replacement;
                }
            }
        }

        let count = sources.get(&id).map_or(0, |s| s.uris.len());
        drop(sources);
        let _ = self.events.send(ShareEvent::SourceRegistered {
            id: id.clone(),
            uris: count,
        });
        Ok(id)
    }

    /// Copy of the source registered as `id`
    pub fn get(&self, id: &ShareId) -> Option<Source> {
        self.sources.read().get(id).cloned()
    }

    /// Whether `id` has a registered source
    pub fn contains(&self, id: &ShareId) -> bool {
        self.sources.read().contains_key(id)
    }

    /// Number of registered sources
    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    /// Whether no source is registered
    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }

    /// Download state of source `id`
    pub fn state(&self, id: &ShareId) -> Option<SourceState> {
        self.sources.read().get(id).map(|s| s.state)
    }

    /// Directly fetchable URL, when the best source is plain HTTP or FTP
    pub fn simple_source(&self, id: &ShareId) -> Option<url::Url> {
        let sources = self.sources.read();
        let source = sources.get(id)?;
        let best = sort_by_priority(&source.uris).pop()?;
        if SourceType::of(&best).is_direct() {
            url::Url::parse(&best).ok()
        } else {
            None
        }
    }

    /// The in-flight downloader for `id`, starting one if there is none
    pub fn download_share(&self, id: &ShareId, ctx: &DownloadContext) -> Result<DownloadHandle> {
        let registry = self
            .self_ref
            .upgrade()
            .ok_or_else(|| ShareError::Internal("registry dropped".to_string()))?;

        let mut sources = self.sources.write();
        let source = sources
            .get_mut(id)
            .ok_or_else(|| ShareError::NotFound(format!("share {}", id)))?;

        if let Some(ref handle) = source.downloader {
            return Ok(handle.clone());
        }
        if source.uris.is_empty() {
            return Err(ShareError::configuration("Download sources are not given"));
        }

        let request = DownloadRequest {
            id: id.clone(),
            file: source.file.clone(),
            contributors: source.contributors.clone(),
            uris: source.uris.clone(),
            range: None,
        };
        let handle = SourceDownloader::spawn(request, ctx.clone());
        source.downloader = Some(handle.clone());
        let old_state = std::mem::replace(&mut source.state, SourceState::Downloading);
        drop(sources);

        self.emit_state(id, old_state, SourceState::Downloading);

        let watched = handle.clone();
        tokio::spawn(async move {
            let outcome = watched.wait().await;
            registry.finish_download(&watched, outcome.is_ok());
        });

        Ok(handle)
    }

    /// Settle the state of the source `handle` was downloading
    ///
    /// Ignored when the source moved on to another downloader meanwhile.
    fn finish_download(&self, handle: &DownloadHandle, success: bool) {
        let id = handle.id();
        let mut sources = self.sources.write();
        let Some(source) = sources.get_mut(id) else {
            return;
        };
        if !source
            .downloader
            .as_ref()
            .is_some_and(|current| current.same_download(handle))
        {
            return;
        }

        source.downloader = None;
        let new_state = if success && handle.phase() == DownloadPhase::Finished {
            SourceState::Cached
        } else {
            SourceState::None
        };
        let old_state = std::mem::replace(&mut source.state, new_state);
        drop(sources);

        tracing::debug!("Source {}: {:?} -> {:?}", id, old_state, new_state);
        self.emit_state(id, old_state, new_state);
    }

    fn emit_state(&self, id: &ShareId, old_state: SourceState, new_state: SourceState) {
        if old_state != new_state {
            let _ = self.events.send(ShareEvent::StateChanged {
                id: id.clone(),
                old_state,
                new_state,
            });
        }
    }

    /// Abort every in-flight downloader
    pub fn abort_all(&self) {
        for source in self.sources.read().values() {
            if let Some(ref handle) = source.downloader {
                handle.abort();
            }
        }
    }
}
