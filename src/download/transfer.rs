//! Opened transfers
//!
//! Every retrieval strategy yields the same shape: what the source told us
//! about the content, followed by the body as a byte stream.

use crate::error::Result;
use crate::protocol::ByteRange;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

/// Body of a transfer
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Content metadata announced by a source when a transfer starts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferMetadata {
    /// Byte range the source agreed to deliver; `None` means the whole content
    pub range: Option<ByteRange>,
    /// Total content size, if the source announced it
    pub total_size: Option<u64>,
    pub media_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl TransferMetadata {
    /// Number of body bytes to expect, if known
    pub fn expected_len(&self) -> Option<u64> {
        match self.range {
            Some(range) => range.size.or_else(|| {
                self.total_size
                    .map(|total| total.saturating_sub(range.start))
            }),
            None => self.total_size,
        }
    }

    /// Trim the announced range to `wanted` when the source agreed to start
    /// there but offered more bytes than were asked for
    pub fn narrowed_to(mut self, wanted: ByteRange) -> Self {
        let Some(delivered) = self.range.filter(|r| r.start == wanted.start) else {
            return self;
        };
        let size = match (wanted.size, self.expected_len()) {
            (Some(asked), Some(offered)) => Some(asked.min(offered)),
            (asked, offered) => asked.or(offered),
        };
        self.range = Some(ByteRange {
            start: delivered.start,
            size,
        });
        self
    }
}

/// A started transfer
pub struct OpenedTransfer {
    pub metadata: TransferMetadata,
    pub body: ByteStream,
}

impl std::fmt::Debug for OpenedTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedTransfer")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
