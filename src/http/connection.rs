//! Shared HTTP client
//!
//! Every network source goes through one `reqwest::Client`. The pool adds
//! an optional bandwidth cap for download bodies and keeps a few counters
//! that tests and logs can inspect.

use crate::config::HttpConfig;
use crate::error::{Result, ShareError};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use reqwest::Client;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Largest permit asked from the limiter in one call
const LIMITER_SLICE: u64 = 16 * 1024;

/// Token bucket over body bytes
struct Throttle {
    limiter: DefaultDirectRateLimiter,
    /// Bucket capacity; a single request may not exceed it
    capacity: u64,
}

impl Throttle {
    fn per_second(bytes: u64) -> Option<Self> {
        let rate = NonZeroU32::new(bytes.min(u32::MAX as u64) as u32)?;
        Some(Self {
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            capacity: rate.get() as u64,
        })
    }

    async fn consume(&self, bytes: u64) {
        let step = LIMITER_SLICE.min(self.capacity).max(1);
        let mut left = bytes;
        while left > 0 {
            let n = left.min(step);
            if let Some(n) = NonZeroU32::new(n as u32) {
                // n <= capacity, so until_n_ready cannot report InsufficientCapacity
                let _ = self.limiter.until_n_ready(n).await;
            }
            left -= n;
        }
    }
}

#[derive(Default)]
struct Counters {
    downloaded: AtomicU64,
    in_flight: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of the pool's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Body bytes received over all transfers
    pub bytes_downloaded: u64,
    /// Bodies currently being streamed
    pub active_transfers: u64,
    pub last_error: Option<String>,
}

/// The HTTP client plus throttling and counters
pub struct ConnectionPool {
    client: Client,
    throttle: Option<Throttle>,
    counters: Counters,
    last_error: Mutex<Option<String>>,
}

impl ConnectionPool {
    /// Build the client from `config`, with no bandwidth cap
    pub fn new(config: &HttpConfig, user_agent: &str) -> Result<Self> {
        // Bodies must arrive as stored: ranges are computed on raw bytes,
        // so no transparent decompression is configured.
        let mut builder = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .read_timeout(Duration::from_secs(config.read_timeout))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(proxy_url) = config.proxy_url.as_deref() {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
                ShareError::configuration(format!("proxy_url {proxy_url:?} rejected: {e}"))
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| ShareError::Internal(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            client,
            throttle: None,
            counters: Counters::default(),
            last_error: Mutex::new(None),
        })
    }

    /// Same as [`ConnectionPool::new`], capping body bytes per second
    pub fn with_limit(config: &HttpConfig, user_agent: &str, limit: Option<u64>) -> Result<Self> {
        let mut pool = Self::new(config, user_agent)?;
        pool.set_download_limit(limit);
        Ok(pool)
    }

    /// The underlying client, shared by every request
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// `None` or `Some(0)` removes the cap
    pub fn set_download_limit(&mut self, limit: Option<u64>) {
        self.throttle = limit.and_then(Throttle::per_second);
    }

    /// Whether a bandwidth cap is in force
    pub fn is_limited(&self) -> bool {
        self.throttle.is_some()
    }

    /// Wait until `bytes` more body bytes may be read
    pub async fn acquire_download(&self, bytes: u64) {
        if let Some(throttle) = &self.throttle {
            throttle.consume(bytes).await;
        }
    }

    /// Count `bytes` of body received
    pub fn record_download(&self, bytes: u64) {
        self.counters.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Body bytes received since the pool was built
    pub fn total_downloaded(&self) -> u64 {
        self.counters.downloaded.load(Ordering::Relaxed)
    }

    /// Bodies being streamed right now
    pub fn active_connections(&self) -> u64 {
        self.counters.in_flight.load(Ordering::Relaxed)
    }

    /// Count a transfer that finished cleanly
    pub fn record_success(&self) {
        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed transfer and remember its error
    pub fn record_failure(&self, error: &str) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    /// Copy of the counters
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            successful_requests: self.counters.succeeded.load(Ordering::Relaxed),
            failed_requests: self.counters.failed.load(Ordering::Relaxed),
            bytes_downloaded: self.total_downloaded(),
            active_transfers: self.active_connections(),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Counts a body transfer as in flight for as long as it lives
pub(crate) struct ConnectionGuard<'a>(&'a ConnectionPool);

impl<'a> ConnectionGuard<'a> {
    pub(crate) fn new(pool: &'a ConnectionPool) -> Self {
        pool.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(pool)
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
