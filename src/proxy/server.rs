//! HTTP listener for shared content
//!
//! One route, `GET <prefix>{share-id}` with an optional `Range` header,
//! served by axum. Each request runs a [`RangeProxy`](super::RangeProxy) writing into an
//! in-process reply whose bounded queue doubles as the response body, so a
//! slow client holds the proxy back instead of making it buffer. Connection
//! reuse, body framing and `HEAD` are left to hyper.

use super::reply::ProxyReply;
use super::sink::{ProxyStatus, ResponseHead};
use super::{spawn_reply, ProxyContext, ProxyRequest};
use crate::error::{NetworkErrorKind, Result, ShareError};
use crate::protocol::ShareId;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::RANGE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Running share server
pub struct ShareServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct ServerState {
    ctx: ProxyContext,
    reply_buffer: usize,
}

impl ShareServer {
    /// Bind `addr` and start serving shares under `prefix`
    ///
    /// `reply_buffer` bounds how many body chunks a response may queue
    /// ahead of the socket.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        ctx: ProxyContext,
        prefix: &str,
        reply_buffer: usize,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ShareError::network(
                NetworkErrorKind::Other,
                format!("Failed to bind share server: {}", e),
            )
        })?;
        let local_addr = listener.local_addr()?;
        let app = router(ctx, prefix, reply_buffer);
        tracing::info!("Share server listening on {}{}", local_addr, prefix);

        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::warn!("Share server on {} failed: {}", local_addr, e);
            }
            tracing::debug!("Share server on {} stopped", local_addr);
        });

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for open responses to wind down
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

fn router(ctx: ProxyContext, prefix: &str, reply_buffer: usize) -> Router {
    let state = ServerState { ctx, reply_buffer };
    Router::new()
        .route(
            &format!("{prefix}{{id}}"),
            get(serve_share).fallback(|| async { status_only(ProxyStatus::BadRequest) }),
        )
        .fallback(|| async { status_only(ProxyStatus::NotFound) })
        .with_state(state)
}

async fn serve_share(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Ok(id) = ShareId::from_hex(&id) else {
        tracing::debug!("Share server: {:?} is not a share id", id);
        return status_only(ProxyStatus::NotFound);
    };
    let request = ProxyRequest {
        id,
        range: headers
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    let mut reply = spawn_reply(state.ctx, request, state.reply_buffer);
    match reply.head().await {
        Ok(head) => into_response(head, reply),
        Err(e) => {
            tracing::debug!("Share server: proxy gave no response: {}", e);
            status_only(ProxyStatus::BadGateway)
        }
    }
}

fn status_code(status: ProxyStatus) -> StatusCode {
    StatusCode::from_u16(status.code()).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn status_only(status: ProxyStatus) -> Response {
    status_code(status).into_response()
}

/// Turn a committed head plus its pending body into an axum response
fn into_response(head: ResponseHead, reply: ProxyReply) -> Response {
    let mut builder = Response::builder().status(status_code(head.status));
    for (name, value) in &head.headers {
        // Connection management belongs to hyper
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        builder = builder.header(*name, value.as_str());
    }
    let body = Body::from_stream(reply.into_body_stream().map(Ok::<_, Infallible>));
    builder.body(body).unwrap_or_else(|e| {
        tracing::warn!("Share server: unusable response head: {}", e);
        status_only(ProxyStatus::BadGateway)
    })
}
