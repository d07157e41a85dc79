//! Durable per-collection status and log store.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

pub const STATUS_RUNNING: &str = "RUNNING";
pub const STATUS_SUCCESS: &str = "SUCCESS";
pub const STATUS_FAILED: &str = "FAILED";

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("meta storage unavailable: {0}")]
    Unavailable(String),
}

/// Status and last log of every (source, collection) pair.
///
/// Pairs that were never written read back as empty strings.
pub trait MetaStorage: Send + Sync {
    fn collection_status(&self, source_id: &str, collection: &str) -> Result<String, MetaError>;

    fn collection_log(&self, source_id: &str, collection: &str) -> Result<String, MetaError>;

    fn update_collection_status(
        &self,
        source_id: &str,
        collection: &str,
        status: &str,
    ) -> Result<(), MetaError>;

    fn update_collection_log(
        &self,
        source_id: &str,
        collection: &str,
        log: &str,
    ) -> Result<(), MetaError>;
}

#[derive(Debug, Default, Clone)]
struct CollectionMeta {
    status: String,
    log: String,
}

#[derive(Debug, Default)]
pub struct InMemoryMetaStorage {
    entries: Mutex<HashMap<(String, String), CollectionMeta>>,
}

impl InMemoryMetaStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, source_id: &str, collection: &str) -> CollectionMeta {
        self.entries
            .lock()
            .get(&(source_id.to_string(), collection.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn write(&self, source_id: &str, collection: &str, f: impl FnOnce(&mut CollectionMeta)) {
        let mut entries = self.entries.lock();
        f(entries
            .entry((source_id.to_string(), collection.to_string()))
            .or_default());
    }
}

impl MetaStorage for InMemoryMetaStorage {
    fn collection_status(&self, source_id: &str, collection: &str) -> Result<String, MetaError> {
        Ok(self.read(source_id, collection).status)
    }

    fn collection_log(&self, source_id: &str, collection: &str) -> Result<String, MetaError> {
        Ok(self.read(source_id, collection).log)
    }

    fn update_collection_status(
        &self,
        source_id: &str,
        collection: &str,
        status: &str,
    ) -> Result<(), MetaError> {
        self.write(source_id, collection, |m| m.status = status.to_string());
        Ok(())
    }

    fn update_collection_log(
        &self,
        source_id: &str,
        collection: &str,
        log: &str,
    ) -> Result<(), MetaError> {
        self.write(source_id, collection, |m| m.log = log.to_string());
        Ok(())
    }
}

/// SQLite-backed meta storage.
pub struct SqliteMetaStorage {
    conn: Mutex<Connection>,
}

impl SqliteMetaStorage {
    pub fn open(path: &Path) -> Result<Self, MetaError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| MetaError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, MetaError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, MetaError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS collection_meta (
                 source_id  TEXT NOT NULL,
                 collection TEXT NOT NULL,
                 status     TEXT NOT NULL DEFAULT '',
                 log        TEXT NOT NULL DEFAULT '',
                 updated_at INTEGER NOT NULL,
                 PRIMARY KEY (source_id, collection)
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn read_column(
        &self,
        column: &'static str,
        source_id: &str,
        collection: &str,
    ) -> Result<String, MetaError> {
        let sql = format!(
            "SELECT {column} FROM collection_meta WHERE source_id = ?1 AND collection = ?2"
        );
        let value = self
            .conn
            .lock()
            .query_row(&sql, params![source_id, collection], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value.unwrap_or_default())
    }

    fn write_column(
        &self,
        column: &'static str,
        source_id: &str,
        collection: &str,
        value: &str,
    ) -> Result<(), MetaError> {
        let sql = format!(
            "INSERT INTO collection_meta (source_id, collection, {column}, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source_id, collection)
             DO UPDATE SET {column} = excluded.{column}, updated_at = excluded.updated_at"
        );
        let now = chrono::Utc::now().timestamp_millis();
        self.conn
            .lock()
            .execute(&sql, params![source_id, collection, value, now])?;
        Ok(())
    }
}

impl MetaStorage for SqliteMetaStorage {
    fn collection_status(&self, source_id: &str, collection: &str) -> Result<String, MetaError> {
        self.read_column("status", source_id, collection)
    }

    fn collection_log(&self, source_id: &str, collection: &str) -> Result<String, MetaError> {
        self.read_column("log", source_id, collection)
    }

    fn update_collection_status(
        &self,
        source_id: &str,
        collection: &str,
        status: &str,
    ) -> Result<(), MetaError> {
        self.write_column("status", source_id, collection, status)
    }

    fn update_collection_log(
        &self,
        source_id: &str,
        collection: &str,
        log: &str,
    ) -> Result<(), MetaError> {
        self.write_column("log", source_id, collection, log)
    }
}
