//! Share events
//!
//! Events emitted by the share manager.

use super::types::{ShareId, SourceState, TransferProgress};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Events emitted by the share manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShareEvent {
    /// A source was registered or merged
    SourceRegistered { id: ShareId, uris: usize },
    /// Retrieval state of a source changed
    StateChanged {
        id: ShareId,
        old_state: SourceState,
        new_state: SourceState,
    },
    /// One candidate URI failed and the downloader moved on
    CandidateFailed {
        id: ShareId,
        uri: String,
        error: String,
    },
    /// Download progress update
    Progress {
        id: ShareId,
        progress: TransferProgress,
    },
    /// Download finished and the file was cached
    DownloadCompleted { id: ShareId, path: PathBuf },
    /// Every candidate failed
    DownloadFailed { id: ShareId, error: String },
    /// Upload progress of a shared item
    PublishProgress {
        id: ShareId,
        progress: TransferProgress,
    },
    /// A shared item finished publishing on every transport
    PublishFinished { id: ShareId, uris: Vec<String> },
}

impl ShareEvent {
    /// The share the event refers to
    pub fn id(&self) -> &ShareId {
        match self {
            Self::SourceRegistered { id, .. }
            | Self::StateChanged { id, .. }
            | Self::CandidateFailed { id, .. }
            | Self::Progress { id, .. }
            | Self::DownloadCompleted { id, .. }
            | Self::DownloadFailed { id, .. }
            | Self::PublishProgress { id, .. }
            | Self::PublishFinished { id, .. } => id,
        }
    }
}
