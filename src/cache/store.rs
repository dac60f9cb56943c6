//! Cache store implementations.
//!
//! A [`CacheStore`] hands out short-lived [`StoreSession`]s. A session is
//! opened for one `generate` call and released when it is closed or dropped,
//! so every exit path gives the underlying resource back.

use super::key::CacheKey;
use crate::{Error, ErrorContext, Result};
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;

pub trait CacheStore: Send + Sync {
    /// Acquire a session. Failing to open is fatal for the calling operation.
    fn open(&self) -> Result<Box<dyn StoreSession>>;
    fn name(&self) -> &'static str;
}

pub trait StoreSession: Send {
    fn get(&mut self, key: &CacheKey) -> Result<Option<Vec<u8>>>;
    /// Write all entries as one unit: either every entry becomes visible or none does.
    fn put_batch(&mut self, entries: &[(CacheKey, Vec<u8>)]) -> Result<()>;
    /// Flush and release the session.
    fn close(self: Box<Self>) -> Result<()>;

    /// Number of stored entries. Inspection only; the caching path never
    /// needs it.
    fn len(&mut self) -> Result<usize>;

    /// Inspection helper built on [`get`](Self::get).
    fn contains(&mut self, key: &CacheKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL,
    created_at INTEGER NOT NULL
)";

/// Durable store backed by a single SQLite file.
///
/// Readers run concurrently under WAL; `put_batch` takes the database write
/// lock (`BEGIN IMMEDIATE`) for the whole batch, so concurrent writers from
/// other processes are serialized and a crash mid-batch rolls back cleanly.
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn store_error(&self, action: &str, e: impl std::fmt::Display) -> Error {
        Error::store_with_context(
            format!("failed to {}: {}", action, e),
            ErrorContext::new()
                .with_field_path(self.path.display().to_string())
                .with_source("sqlite_store"),
        )
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| self.store_error("create cache directory", e))?;
            }
        }
        let conn = Connection::open(&self.path).map_err(|e| self.store_error("open cache", e))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| self.store_error("set busy timeout", e))?;
        // Every connection re-checks the schema: the file may have been
        // deleted since the last session to reset the cache.
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| self.store_error("enable WAL", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| self.store_error("create schema", e))?;
        trace!(path = %self.path.display(), journal_mode = %mode, "cache store connected");
        Ok(conn)
    }
}

impl CacheStore for SqliteStore {
    fn open(&self) -> Result<Box<dyn StoreSession>> {
        let conn = self.connect()?;
        Ok(Box::new(SqliteSession { conn }))
    }
    fn name(&self) -> &'static str {
        "sqlite"
    }
}

struct SqliteSession {
    conn: Connection,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl StoreSession for SqliteSession {
    fn get(&mut self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .prepare_cached("SELECT value FROM cache_entries WHERE key = ?1")?
            .query_row(params![key.as_str()], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn put_batch(&mut self, entries: &[(CacheKey, Vec<u8>)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = unix_now();
        // Dropping `tx` without commit rolls back.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO cache_entries (key, value, created_at) VALUES (?1, ?2, ?3)",
            )?;
            for (key, value) in entries {
                stmt.execute(params![key.as_str(), value, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn len(&mut self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn close(self: Box<Self>) -> Result<()> {
        let SqliteSession { conn } = *self;
        conn.close().map_err(|(_, e)| Error::from(e))
    }
}

/// Process-local store with LRU eviction, shared by all of its sessions.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<LruCache<CacheKey, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(cap))),
        }
    }
}

impl CacheStore for MemoryStore {
    fn open(&self) -> Result<Box<dyn StoreSession>> {
        Ok(Box::new(MemorySession {
            entries: Arc::clone(&self.entries),
        }))
    }
    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySession {
    entries: Arc<Mutex<LruCache<CacheKey, Vec<u8>>>>,
}

impl MemorySession {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<CacheKey, Vec<u8>>>> {
        self.entries.lock().map_err(|_| {
            Error::store_with_context(
                "memory store poisoned",
                ErrorContext::new().with_source("memory_store"),
            )
        })
    }
}

impl StoreSession for MemorySession {
    fn get(&mut self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }
    fn put_batch(&mut self, entries: &[(CacheKey, Vec<u8>)]) -> Result<()> {
        let mut guard = self.lock()?;
        for (key, value) in entries {
            guard.put(key.clone(), value.clone());
        }
        Ok(())
    }
    fn len(&mut self) -> Result<usize> {
        Ok(self.lock()?.len())
    }
    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Store that never hits and discards every write. Used when caching is disabled.
pub struct NullStore;
impl NullStore {
    pub fn new() -> Self {
        Self
    }
}
impl Default for NullStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for NullStore {
    fn open(&self) -> Result<Box<dyn StoreSession>> {
        Ok(Box::new(NullStore))
    }
    fn name(&self) -> &'static str {
        "null"
    }
}

impl StoreSession for NullStore {
    fn get(&mut self, _: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    fn put_batch(&mut self, _: &[(CacheKey, Vec<u8>)]) -> Result<()> {
        Ok(())
    }
    fn len(&mut self) -> Result<usize> {
        Ok(0)
    }
    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
