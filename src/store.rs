//! Durable key-value storage
//!
//! The EPG service only needs a handful of string blobs persisted between
//! sessions (the schedule cache and the custom source URL), so storage is
//! modelled as a tiny key-value interface with two backends:
//! - `SqliteStore`: rusqlite with an r2d2 pool, WAL mode
//! - `MemoryStore`: in-process map, used for tests and throwaway sessions
//!
//! Both can be given a capacity so callers can exercise quota handling.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use parking_lot::Mutex;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, ErrorCode, OptionalExtension};
use tracing::{debug, info};

/// Errors raised by a storage backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage capacity exceeded: {needed} bytes requested, {limit} allowed")]
    CapacityExceeded { needed: usize, limit: usize },
    #[error("storage full: {needed} bytes could not be written")]
    Full { needed: usize },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl StoreError {
    /// The write failed for lack of space; freeing some may let it through
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. } | Self::Full { .. })
    }
}

/// Namespaced string storage
pub trait KeyValueStore: Send + Sync {
    fn read(&self, namespace: &str) -> Result<Option<String>, StoreError>;
    fn write(&self, namespace: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, namespace: &str) -> Result<(), StoreError>;
    /// All namespaces currently holding a value
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

// ============================================================================
// SQLite backend
// ============================================================================

/// Connections per file-backed pool
const POOL_SIZE: u32 = 5;

/// SQLite-backed store with a small connection pool
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    max_value_bytes: Option<usize>,
}

impl SqliteStore {
    /// Open (or create) the store at `db_path`
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening EPG store at: {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        Self::from_manager(manager, POOL_SIZE)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> anyhow::Result<Self> {
        // Every connection would get its own database, keep the pool at one
        Self::from_manager(SqliteConnectionManager::memory(), 1)
    }

    /// Default on-disk location under the platform data directory
    pub fn default_path() -> anyhow::Result<std::path::PathBuf> {
        let data_dir = dirs::data_dir().context("Failed to get data directory")?;
        Ok(data_dir.join("ynotv").join("epg.db"))
    }

    fn from_manager(manager: SqliteConnectionManager, max_size: u32) -> anyhow::Result<Self> {
        let pool = Pool::builder()
            .max_size(max_size)
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)
            .context("Failed to create store pool")?;

        let store = Self {
            pool,
            max_value_bytes: None,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Reject writes larger than `bytes` with `StoreError::CapacityExceeded`
    pub fn with_max_value_bytes(mut self, bytes: usize) -> Self {
        self.max_value_bytes = Some(bytes);
        self
    }

    fn get_conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }

    /// Cap the database size in pages, so tests can fill it up
    #[cfg(test)]
    pub(crate) fn set_max_page_count(&self, pages: u32) -> Result<(), StoreError> {
        let conn = self.get_conn()?;
        conn.query_row(&format!("PRAGMA max_page_count = {}", pages), [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(())
    }

    fn initialize_schema(&self) -> anyhow::Result<()> {
        let conn = self.get_conn()?;

        // PRAGMA journal_mode returns the new mode, so we use query_row.
        // In-memory databases report "memory" and that is fine.
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("EPG store journal mode: {}", journal_mode);

        conn.execute(
            "CREATE TABLE IF NOT EXISTS epg_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )
        .context("Failed to create epg_store table")?;

        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    fn read(&self, namespace: &str) -> Result<Option<String>, StoreError> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM epg_store WHERE key = ?1",
                [namespace],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write(&self, namespace: &str, value: &str) -> Result<(), StoreError> {
        if let Some(limit) = self.max_value_bytes {
            if value.len() > limit {
                return Err(StoreError::CapacityExceeded {
                    needed: value.len(),
                    limit,
                });
            }
        }

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO epg_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![namespace, value, chrono::Utc::now().timestamp()],
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::DiskFull) | Some(ErrorCode::TooBig) => StoreError::Full {
                needed: value.len(),
            },
            _ => StoreError::Sqlite(e),
        })?;

        debug!("Stored {} bytes under '{}'", value.len(), namespace);
        Ok(())
    }

    fn remove(&self, namespace: &str) -> Result<(), StoreError> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM epg_store WHERE key = ?1", [namespace])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT key FROM epg_store ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Map-backed store; `capacity` bounds the total stored bytes
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    capacity: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_bytes(capacity: usize) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, namespace: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().get(namespace).cloned())
    }

    fn write(&self, namespace: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock();

        if let Some(limit) = self.capacity {
            let others: usize = values
                .iter()
                .filter(|(k, _)| k.as_str() != namespace)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = others + namespace.len() + value.len();
            if needed > limit {
                return Err(StoreError::CapacityExceeded { needed, limit });
            }
        }

        values.insert(namespace.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, namespace: &str) -> Result<(), StoreError> {
        self.values.lock().remove(namespace);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self.values.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
