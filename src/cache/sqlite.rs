//! File cache with a SQLite index
//!
//! Payloads are plain files named after their share id inside the cache
//! directory; ids, metadata and expiry live in a SQLite index (WAL mode).

use super::{CacheEntry, CacheMetadata, ContentCache};
use crate::error::{Result, ShareError, StorageErrorKind};
use crate::protocol::ShareId;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Content cache storing payloads as files next to a SQLite index
pub struct FileCache {
    dir: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl FileCache {
    /// Open (or create) a cache in `dir` indexed by the database at `db_path`
    pub async fn new(dir: impl AsRef<Path>, db_path: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_dir(&dir).await?;
        if let Some(parent) = db_path.as_ref().parent() {
            create_dir(parent).await?;
        }

        let path = db_path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;

            // WAL keeps readers and the writer out of each other's way
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            migrate(&conn)?;

            Ok(conn)
        })
        .await
        .map_err(|e| ShareError::Database(format!("Failed to initialize cache index: {}", e)))??;

        Ok(Self {
            dir,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Cache in `dir` with an in-memory index (for testing)
    pub async fn in_memory(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_dir(&dir).await?;

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| ShareError::Database(format!("Failed to create in-memory index: {}", e)))??;

        Ok(Self {
            dir,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Directory holding the payload files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, id: &ShareId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    /// Delete the index row and any payload file for `id`
    async fn delete(&self, id: &ShareId) -> Result<bool> {
        let conn = self.conn.clone();
        let key = id.to_string();
        let removed = tokio::task::spawn_blocking(move || -> Result<bool> {
            let conn = conn.blocking_lock();
            let n = conn.execute("DELETE FROM entries WHERE id = ?1", params![key])?;
            Ok(n > 0)
        })
        .await??;

        remove_payload(&self.data_path(id)).await?;
        Ok(removed)
    }
}

async fn create_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            ShareError::storage(
                StorageErrorKind::Io,
                dir,
                format!("Failed to create directory: {}", e),
            )
        })?;
    }
    Ok(())
}

async fn remove_payload(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ShareError::from(e).at_path(path)),
    }
}

/// Current schema version; bump when adding migrations
const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Index schema v1
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    metadata_json TEXT NOT NULL,
    ttl_secs INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    -- unix milliseconds, compared in queries
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_expires ON entries(expires_at);
"#;

/// Bring the index up to `CURRENT_SCHEMA_VERSION` using `PRAGMA user_version`.
fn migrate(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    debug_assert_eq!(
        conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))
            .unwrap_or_default(),
        CURRENT_SCHEMA_VERSION
    );

    Ok(())
}

/// A row of the `entries` table
struct Row {
    size: u64,
    metadata_json: String,
    ttl_secs: u64,
    created_at: String,
    expires_at: i64,
}

fn expiry(now: DateTime<Utc>, ttl: u64) -> DateTime<Utc> {
    i64::try_from(ttl)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl FileCache {
    fn entry_from_row(&self, id: &ShareId, row: Row) -> Result<CacheEntry> {
        let metadata: CacheMetadata = serde_json::from_str(&row.metadata_json)?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| ShareError::Database(format!("Invalid created_at: {}", e)))?;
        let expires_at = Utc
            .timestamp_millis_opt(row.expires_at)
            .single()
            .ok_or_else(|| ShareError::Database(format!("Invalid expires_at: {}", row.expires_at)))?;
        Ok(CacheEntry {
            id: id.clone(),
            data_path: self.data_path(id),
            size: row.size,
            metadata,
            created_at,
            expires_at,
            ttl: row.ttl_secs,
        })
    }
}

#[async_trait]
impl ContentCache for FileCache {
    async fn get(&self, id: &ShareId, reborn: bool) -> Result<Option<CacheEntry>> {
        let conn = self.conn.clone();
        let key = id.to_string();
        let row = tokio::task::spawn_blocking(move || -> Result<Option<Row>> {
            let conn = conn.blocking_lock();
            let row = conn
                .query_row(
                    "SELECT size, metadata_json, ttl_secs, created_at, expires_at
                     FROM entries WHERE id = ?1",
                    params![key],
                    |row| {
                        Ok(Row {
                            size: row.get::<_, i64>(0)? as u64,
                            metadata_json: row.get(1)?,
                            ttl_secs: row.get::<_, i64>(2)? as u64,
                            created_at: row.get(3)?,
                            expires_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await??;

        let Some(row) = row else {
            tracing::debug!("Cache miss: {}", id);
            return Ok(None);
        };
        let mut entry = self.entry_from_row(id, row)?;

        let now = Utc::now();
        if entry.is_expired_at(now) {
            tracing::debug!("Cache entry {} expired at {}", id, entry.expires_at);
            self.delete(id).await?;
            return Ok(None);
        }

        if !entry.file_path().exists() {
            tracing::warn!(
                "Cache entry {} lost its file {:?}, dropping it",
                id,
                entry.file_path()
            );
            self.delete(id).await?;
            return Ok(None);
        }

        if reborn {
            entry.expires_at = expiry(now, entry.ttl);
            let conn = self.conn.clone();
            let key = id.to_string();
            let expires_at = entry.expires_at.timestamp_millis();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let conn = conn.blocking_lock();
                conn.execute(
                    "UPDATE entries SET expires_at = ?1 WHERE id = ?2",
                    params![expires_at, key],
                )?;
                Ok(())
            })
            .await??;
        }

        tracing::debug!("Cache hit: {} ({} bytes)", id, entry.size);
        Ok(Some(entry))
    }

    async fn append(
        &self,
        id: &ShareId,
        data: Bytes,
        metadata: CacheMetadata,
        ttl: u64,
    ) -> Result<CacheEntry> {
        let data_path = self.data_path(id);

        let size = match (&metadata.link, data.is_empty()) {
            (Some(link), true) => {
                // Linked content: stat the file, drop any stale payload
                let meta = tokio::fs::metadata(link)
                    .await
                    .map_err(|e| ShareError::from(e).at_path(link))?;
                remove_payload(&data_path).await?;
                meta.len()
            }
            _ => {
                let dir = self.dir.clone();
                let target = data_path.clone();
                let payload = data.clone();
                tokio::task::spawn_blocking(move || -> Result<()> {
                    let mut tmp = tempfile::Builder::new()
                        .prefix(".incoming-")
                        .tempfile_in(&dir)
                        .map_err(|e| ShareError::from(e).at_path(&dir))?;
                    tmp.write_all(&payload)?;
                    tmp.as_file().sync_all()?;
                    tmp.persist(&target)
                        .map_err(|e| ShareError::from(e.error).at_path(&target))?;
                    Ok(())
                })
                .await??;
                data.len() as u64
            }
        };

        let now = Utc::now();
        let entry = CacheEntry {
            id: id.clone(),
            data_path,
            size,
            metadata,
            created_at: now,
            expires_at: expiry(now, ttl),
            ttl,
        };

        let conn = self.conn.clone();
        let key = id.to_string();
        let metadata_json = serde_json::to_string(&entry.metadata)?;
        let created_at = entry.created_at.to_rfc3339();
        let expires_at = entry.expires_at.timestamp_millis();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO entries
                 (id, size, metadata_json, ttl_secs, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    key,
                    size as i64,
                    metadata_json,
                    ttl.min(i64::MAX as u64) as i64,
                    created_at,
                    expires_at
                ],
            )?;
            Ok(())
        })
        .await??;

        tracing::debug!("Cached {} ({} bytes, ttl {}s)", id, size, ttl);
        Ok(entry)
    }

    async fn remove(&self, id: &ShareId) -> Result<bool> {
        self.delete(id).await
    }

    async fn purge_expired(&self) -> Result<usize> {
        let conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let expired = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare("SELECT id FROM entries WHERE expires_at <= ?1")?;
            let ids = stmt
                .query_map(params![now], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            conn.execute("DELETE FROM entries WHERE expires_at <= ?1", params![now])?;
            Ok(ids)
        })
        .await??;

        for key in &expired {
            if let Ok(id) = ShareId::from_hex(key) {
                remove_payload(&self.data_path(&id)).await?;
            }
        }
        if !expired.is_empty() {
            tracing::info!("Purged {} expired cache entries", expired.len());
        }
        Ok(expired.len())
    }
}
