//! SQLite storage: feeds, subfeeds, subfeed messages, feed keys and names.
//!
//! All access is synchronous (rusqlite). Async callers use `spawn_blocking`.
//! One connection per process, behind a mutex: SQLite is single-writer and
//! the store does not rely on its locking across handles.
//!
//! Feed and subfeed rows are created lazily inside the same transaction that
//! appends messages, so concurrent first writers never race on parent rows.

mod keys;
mod messages;

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::feed::models::{FeedId, SubfeedHash};

/// Thread-safe wrapper around a SQLite connection.
/// All access is synchronous; use tokio::task::spawn_blocking from async code.
#[derive(Clone)]
pub struct FeedStore {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA_DDL: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS feeds (
        feed_id TEXT PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS subfeeds (
        feed_id TEXT NOT NULL,
        subfeed_hash TEXT NOT NULL,
        PRIMARY KEY (feed_id, subfeed_hash),
        FOREIGN KEY (feed_id) REFERENCES feeds(feed_id) ON DELETE CASCADE
    );
    CREATE TABLE IF NOT EXISTS subfeed_messages (
        feed_id TEXT NOT NULL,
        subfeed_hash TEXT NOT NULL,
        position INTEGER NOT NULL,
        message TEXT NOT NULL,
        PRIMARY KEY (feed_id, subfeed_hash, position),
        FOREIGN KEY (feed_id, subfeed_hash)
            REFERENCES subfeeds(feed_id, subfeed_hash) ON DELETE CASCADE
    );
    CREATE TABLE IF NOT EXISTS feed_keys (
        feed_id TEXT PRIMARY KEY,
        private_key TEXT NOT NULL,
        FOREIGN KEY (feed_id) REFERENCES feeds(feed_id) ON DELETE CASCADE
    );
    CREATE TABLE IF NOT EXISTS feed_names (
        name TEXT PRIMARY KEY,
        feed_id TEXT NOT NULL,
        FOREIGN KEY (feed_id) REFERENCES feeds(feed_id) ON DELETE CASCADE
    );
";

impl FeedStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Acquire the database connection, recovering from mutex poisoning.
    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA_DDL)?;
        Ok(())
    }

    // ---- Feed operations ----

    /// Ensure the feed row exists. Idempotent.
    pub fn add_feed(&self, feed_id: &FeedId) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO feeds (feed_id) VALUES (?1)",
            params![feed_id.as_str()],
        )?;
        Ok(())
    }

    /// Delete a feed with its subfeeds, messages, key and names.
    /// Returns false if the feed did not exist.
    pub fn delete_feed(&self, feed_id: &FeedId) -> Result<bool> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM feeds WHERE feed_id = ?1",
            params![feed_id.as_str()],
        )?;
        Ok(removed > 0)
    }

    pub fn has_feed(&self, feed_id: &FeedId) -> Result<bool> {
        let conn = self.conn();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM feeds WHERE feed_id = ?1",
                params![feed_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn subfeed_exists(&self, feed_id: &FeedId, subfeed_hash: &SubfeedHash) -> Result<bool> {
        let conn = self.conn();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM subfeeds WHERE feed_id = ?1 AND subfeed_hash = ?2",
                params![feed_id.as_str(), subfeed_hash.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All feeds held locally, writable or not.
    pub fn list_feeds(&self) -> Result<Vec<FeedId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT feed_id FROM feeds ORDER BY feed_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        ids.iter().map(|s| FeedId::parse(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn feed_id() -> FeedId {
        FeedId::from_identity(&Identity::generate())
    }

    #[test]
    fn add_feed_idempotent() {
        let store = FeedStore::open_memory().unwrap();
        let id = feed_id();
        assert!(!store.has_feed(&id).unwrap());

        store.add_feed(&id).unwrap();
        store.add_feed(&id).unwrap();
        assert!(store.has_feed(&id).unwrap());
        assert_eq!(store.list_feeds().unwrap(), vec![id]);
    }

    #[test]
    fn delete_missing_feed_returns_false() {
        let store = FeedStore::open_memory().unwrap();
        assert!(!store.delete_feed(&feed_id()).unwrap());
    }

    #[test]
    fn reopen_file_database_keeps_feeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeds.db");
        let id = feed_id();
        {
            let store = FeedStore::open(&path).unwrap();
            store.add_feed(&id).unwrap();
        }
        let store = FeedStore::open(&path).unwrap();
        assert!(store.has_feed(&id).unwrap());
    }
}
