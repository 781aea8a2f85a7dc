//! Publishing local content
//!
//! A [`ShareItem`] is one file, image or voice clip the user wants to send.
//! Publishing uploads it through an [`Uploader`] and makes it available for
//! peer-to-peer retrieval; once every transport is done the item is folded
//! into the content cache.

pub mod item;
pub mod mime;

pub use item::{PublishContext, ShareItem};

use crate::error::{Result, ShareError};
use crate::protocol::TransferProgress;
use async_trait::async_trait;
use std::path::Path;

/// Upload progress callback
pub type ProgressFn<'a> = &'a (dyn Fn(TransferProgress) + Send + Sync);

/// Network upload transport (e.g. an HTTP upload service)
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `file` as `name`, returning the URL it can be fetched from
    async fn upload(
        &self,
        file: &Path,
        name: &str,
        media_type: &str,
        progress: ProgressFn<'_>,
    ) -> Result<String>;
}

/// Uploader for accounts without an upload service
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUploader;

#[async_trait]
impl Uploader for NoUploader {
    async fn upload(
        &self,
        _file: &Path,
        name: &str,
        _media_type: &str,
        _progress: ProgressFn<'_>,
    ) -> Result<String> {
        Err(ShareError::configuration(format!(
            "no upload service available for {}",
            name
        )))
    }
}
