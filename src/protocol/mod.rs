//! Protocol types for gosh-share
//!
//! This module contains all types that cross the manager boundary:
//! - Share ids, peer addresses and byte ranges
//! - File descriptors and media share references
//! - Source URI classification and priority ordering
//! - Events emitted by the manager
//!
//! These types are designed for serialization and can be used for IPC,
//! RPC, or any message-passing interface.

mod events;
mod file;
mod source;
mod types;

// Re-export all protocol types
pub use events::ShareEvent;
pub use file::{AudioSpectrum, FileDescriptor, FileHash, HashAlgorithm, MediaShare, Thumbnail};
pub use source::{sort_by_priority, SourceType};
pub use types::{ByteRange, PeerId, ShareId, SourceState, TransferProgress};
