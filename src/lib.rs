//! # gosh-share
//!
//! Content-addressed file sharing for a chat client.
//!
//! ## Features
//!
//! - **Content cache**: Files keyed by their SHA-1, with per-entry lifetimes
//! - **Publishing**: Upload plus peer-to-peer offers, tracked until every transport settles
//! - **Multi-source downloads**: HTTP, in-band data and peer transfers with failover and resume
//! - **Range proxy**: Serve cached or still-downloading content with HTTP `Range` semantics
//! - **Async**: Built on Tokio, every consumer of a download shares one transfer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gosh_share::{FileDescriptor, FileHash, ShareConfig, ShareManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ShareManager::new(ShareConfig::default()).await?;
//!
//!     // Register a remote file and start downloading it
//!     let file = FileDescriptor::new("photo.jpg")
//!         .with_hash(FileHash::sha1(vec![0u8; 20]));
//!     let id = manager.register_source(
//!         &file,
//!         None,
//!         &["https://example.com/photo.jpg".to_string()],
//!     )?;
//!     let download = manager.download_share(&id)?;
//!
//!     // Subscribe to events
//!     let mut events = manager.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     println!("Saved to {:?}", download.wait().await?);
//!     Ok(())
//! }
//! ```

// Modules
pub mod cache;
pub mod checksum;
pub mod config;
pub mod download;
pub mod error;
pub mod http;
pub mod manager;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod share;

// Re-exports for convenience
pub use config::{HttpConfig, ProxyConfig, ShareConfig};
pub use error::{NetworkErrorKind, ProtocolErrorKind, Result, ShareError, StorageErrorKind};
pub use manager::{Backends, ShareManager};
pub use protocol::{
    AudioSpectrum, ByteRange, FileDescriptor, FileHash, HashAlgorithm, MediaShare, PeerId,
    ShareEvent, ShareId, SourceState, SourceType, Thumbnail, TransferProgress,
};

// Cache exports
pub use cache::{CacheEntry, CacheMetadata, ContentCache, FileCache};

// Download exports
pub use download::{
    BobData, DownloadHandle, DownloadPhase, DownloadReader, DownloadSnapshot, OfflinePeers,
    PeerNetwork, SourceDownloader,
};

// Registry exports
pub use registry::{Source, SourceRegistry};

// Share exports
pub use share::{NoUploader, ShareItem, Uploader};

// Proxy exports
pub use proxy::{ProxyReply, ProxyRequest, ProxyStatus, RangeProxy, ResponseHead, ShareServer};
