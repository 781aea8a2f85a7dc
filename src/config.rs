//! Share manager configuration
//!
//! This module contains all configuration options for the sharing subsystem.

use crate::error::{Result, ShareError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Lifetime of downloaded or published files kept in the cache (one year)
pub const FILE_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Lifetime of temporary payloads (pasted images, voice clips) kept in the cache
pub const TEMP_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Main configuration for the share manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Directory holding cached payloads and the cache index
    pub cache_dir: PathBuf,

    /// Directory completed downloads are moved into
    pub documents_dir: PathBuf,

    /// Directory for temporary share payloads
    pub temp_dir: PathBuf,

    /// Cache index database path
    pub database_path: Option<PathBuf>,

    /// Cache lifetime of regular files in seconds
    pub file_ttl: u64,

    /// Cache lifetime of temporary payloads in seconds
    pub temp_ttl: u64,

    /// Download speed limit (bytes/sec, None = unlimited)
    pub download_limit: Option<u64>,

    /// User agent for network sources
    pub user_agent: String,

    /// Interval between progress events in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// HTTP client configuration
    pub http: HttpConfig,

    /// Range proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// HTTP-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Read timeout in seconds
    pub read_timeout: u64,

    /// Maximum redirects to follow
    pub max_redirects: usize,

    /// Whether to accept invalid TLS certificates (dangerous!)
    pub accept_invalid_certs: bool,

    /// Proxy URL (e.g., "http://proxy:8080" or "socks5://proxy:1080")
    pub proxy_url: Option<String>,
}

/// Range proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upper bound for a single body write in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Number of body chunks an in-process reply may buffer ahead of its reader
    #[serde(default = "default_reply_buffer")]
    pub reply_buffer: usize,

    /// URL path prefix served by the share server, e.g. `/share/`
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_chunk_size() -> usize {
    512 * 1024 // 512 KiB
}

fn default_reply_buffer() -> usize {
    4
}

fn default_path_prefix() -> String {
    "/share/".to_string()
}

impl Default for ShareConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("gosh-share")
            .join("shares");
        Self {
            cache_dir,
            documents_dir: dirs::document_dir().unwrap_or_else(|| PathBuf::from(".")),
            temp_dir: std::env::temp_dir(),
            database_path: None,
            file_ttl: FILE_TTL_SECS,
            temp_ttl: TEMP_TTL_SECS,
            download_limit: None,
            user_agent: format!("gosh-share/{}", env!("CARGO_PKG_VERSION")),
            progress_interval_ms: default_progress_interval_ms(),
            http: HttpConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            read_timeout: 60,
            max_redirects: 10,
            accept_invalid_certs: false,
            proxy_url: None,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            reply_buffer: default_reply_buffer(),
            path_prefix: default_path_prefix(),
        }
    }
}

impl ShareConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache directory
    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = path.into();
        self
    }

    /// Set the documents directory
    pub fn documents_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.documents_dir = path.into();
        self
    }

    /// Set the temporary payload directory
    pub fn temp_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_dir = path.into();
        self
    }

    /// Set the database path for the cache index
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Set cache lifetimes for regular and temporary content
    pub fn ttls(mut self, file_ttl: Duration, temp_ttl: Duration) -> Self {
        self.file_ttl = file_ttl.as_secs();
        self.temp_ttl = temp_ttl.as_secs();
        self
    }

    /// Set download speed limit
    pub fn download_limit(mut self, limit: Option<u64>) -> Self {
        self.download_limit = limit;
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Set the proxy chunk size cap
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.proxy.chunk_size = size;
        self
    }

    /// Set the progress event interval
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.documents_dir.exists() {
            return Err(ShareError::invalid_input(
                "documents_dir",
                format!("Directory does not exist: {:?}", self.documents_dir),
            ));
        }

        if !self.documents_dir.is_dir() {
            return Err(ShareError::invalid_input(
                "documents_dir",
                format!("Path is not a directory: {:?}", self.documents_dir),
            ));
        }

        if self.cache_dir.exists() && !self.cache_dir.is_dir() {
            return Err(ShareError::invalid_input(
                "cache_dir",
                format!("Path is not a directory: {:?}", self.cache_dir),
            ));
        }

        if self.file_ttl == 0 || self.temp_ttl == 0 {
            return Err(ShareError::invalid_input("ttl", "Must be at least 1 second"));
        }

        if self.proxy.chunk_size == 0 {
            return Err(ShareError::invalid_input("chunk_size", "Must be at least 1"));
        }

        if self.proxy.reply_buffer == 0 {
            return Err(ShareError::invalid_input("reply_buffer", "Must be at least 1"));
        }

        let prefix = &self.proxy.path_prefix;
        if !prefix.starts_with('/') || !prefix.ends_with('/') {
            return Err(ShareError::invalid_input(
                "path_prefix",
                format!("Must start and end with '/': {}", prefix),
            ));
        }

        if self.download_limit == Some(0) {
            return Err(ShareError::invalid_input(
                "download_limit",
                "Use None for unlimited",
            ));
        }

        Ok(())
    }

    /// Get the database path, using default if not set
    pub fn get_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("index.db"))
    }

    pub(crate) fn progress_interval_duration(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ShareConfig::default();
        assert_eq!(config.file_ttl, 365 * 24 * 3600);
        assert_eq!(config.temp_ttl, 7 * 24 * 3600);
        assert_eq!(config.proxy.chunk_size, 512 * 1024);
        assert_eq!(config.proxy.path_prefix, "/share/");
        assert!(config.cache_dir.ends_with("gosh-share/shares"));
    }

    #[test]
    fn test_config_builder() {
        let config = ShareConfig::new()
            .chunk_size(4096)
            .download_limit(Some(1024 * 1024))
            .ttls(Duration::from_secs(60), Duration::from_secs(30));

        assert_eq!(config.proxy.chunk_size, 4096);
        assert_eq!(config.download_limit, Some(1024 * 1024));
        assert_eq!(config.file_ttl, 60);
        assert_eq!(config.temp_ttl, 30);
    }

    #[test]
    fn test_config_validation() {
        let dir = tempdir().unwrap();
        let config = ShareConfig::new()
            .documents_dir(dir.path())
            .cache_dir(dir.path().join("cache"));
        assert!(config.validate().is_ok());

        let missing = ShareConfig::new().documents_dir("/nonexistent/path/12345");
        assert!(missing.validate().is_err());

        let zero_chunk = config.clone().chunk_size(0);
        assert!(zero_chunk.validate().is_err());

        let mut bad_prefix = config.clone();
        bad_prefix.proxy.path_prefix = "share".to_string();
        assert!(bad_prefix.validate().is_err());
    }

    #[test]
    fn test_default_database_path_lives_in_cache_dir() {
        let config = ShareConfig::new().cache_dir("/var/cache/shares");
        assert_eq!(
            config.get_database_path(),
            PathBuf::from("/var/cache/shares/index.db")
        );

        let config = config.database_path("/tmp/other.db");
        assert_eq!(config.get_database_path(), PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn test_config_serde_fills_proxy_defaults() {
        let config = ShareConfig::default();
        let mut value = serde_json::to_value(&config).unwrap();
        value.as_object_mut().unwrap().remove("proxy");
        value.as_object_mut().unwrap().remove("progress_interval_ms");
        let parsed: ShareConfig = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.proxy.chunk_size, 512 * 1024);
        assert_eq!(parsed.progress_interval_ms, 250);
    }
}
