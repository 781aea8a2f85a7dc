//! In-process proxied replies
//!
//! The consumer side gets the head as soon as it is committed and pulls the
//! body from a bounded queue, so the proxy never runs more than
//! `reply_buffer` chunks ahead. The share server hands the same queue to
//! its HTTP body, so the socket's pace is what drives the proxy.

use super::sink::{ResponseHead, ResponseSink};
use crate::error::{Result, ShareError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};

/// Producer half of an in-process reply
pub struct ReplySink {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: Option<mpsc::Sender<Bytes>>,
}

/// Consumer half of an in-process reply
pub struct ProxyReply {
    head: Option<oneshot::Receiver<ResponseHead>>,
    body: mpsc::Receiver<Bytes>,
}

/// Create a connected sink/reply pair
pub fn reply_channel(buffer: usize) -> (ReplySink, ProxyReply) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(buffer.max(1));
    (
        ReplySink {
            head: Some(head_tx),
            body: Some(body_tx),
        },
        ProxyReply {
            head: Some(head_rx),
            body: body_rx,
        },
    )
}

fn consumer_gone() -> ShareError {
    ShareError::Internal("reply consumer went away".to_string())
}

#[async_trait]
impl ResponseSink for ReplySink {
    async fn send_head(&mut self, head: ResponseHead) -> Result<()> {
        let tx = self
            .head
            .take()
            .ok_or_else(|| ShareError::Internal("response head already sent".to_string()))?;
        tx.send(head).map_err(|_| consumer_gone())
    }

    async fn send_body(&mut self, chunk: Bytes) -> Result<()> {
        let tx = self.body.as_ref().ok_or_else(consumer_gone)?;
        tx.send(chunk).await.map_err(|_| consumer_gone())
    }

    async fn finish(&mut self) -> Result<()> {
        self.body = None;
        Ok(())
    }
}

impl ProxyReply {
    /// Wait for the response head
    pub async fn head(&mut self) -> Result<ResponseHead> {
        let rx = self
            .head
            .take()
            .ok_or_else(|| ShareError::Internal("response head already taken".to_string()))?;
        rx.await
            .map_err(|_| ShareError::Internal("proxy ended without a response".to_string()))
    }

    /// Next body chunk; `None` at the end of the body
    pub async fn chunk(&mut self) -> Option<Bytes> {
        self.body.recv().await
    }

    /// The remaining body as a stream; it ends with the response
    pub fn into_body_stream(self) -> impl Stream<Item = Bytes> + Send + 'static {
        futures::stream::unfold(self.body, |mut body| async move {
            body.recv().await.map(|chunk| (chunk, body))
        })
    }

    /// Read the whole response
    pub async fn collect(mut self) -> Result<(ResponseHead, Vec<u8>)> {
        let head = self.head().await?;
        let mut body = Vec::new();
        while let Some(chunk) = self.chunk().await {
            body.extend_from_slice(&chunk);
        }
        Ok((head, body))
    }
}
