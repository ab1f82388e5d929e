//! Feed signing keys and human-readable feed names.

use rusqlite::{params, OptionalExtension, TransactionBehavior};

use crate::error::Result;
use crate::feed::models::FeedId;
use crate::identity::Identity;

use super::FeedStore;

impl FeedStore {
    // ---- Feed key operations ----

    /// Store the private key of a locally created feed (and its feed row).
    pub fn add_feed_key(&self, feed_id: &FeedId, key: &Identity) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO feeds (feed_id) VALUES (?1)",
            params![feed_id.as_str()],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO feed_keys (feed_id, private_key) VALUES (?1, ?2)",
            params![feed_id.as_str(), key.secret_hex()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_feed_key(&self, feed_id: &FeedId) -> Result<Option<Identity>> {
        let conn = self.conn();
        let secret: Option<String> = conn
            .query_row(
                "SELECT private_key FROM feed_keys WHERE feed_id = ?1",
                params![feed_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        secret.map(|s| Identity::from_secret_hex(&s)).transpose()
    }

    pub fn has_writeable_feed(&self, feed_id: &FeedId) -> Result<bool> {
        Ok(self.get_feed_key(feed_id)?.is_some())
    }

    // ---- Feed name operations ----

    /// Point `name` at `feed_id`, replacing any previous mapping.
    pub fn set_feed_name(&self, name: &str, feed_id: &FeedId) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO feed_names (name, feed_id) VALUES (?1, ?2)",
            params![name, feed_id.as_str()],
        )?;
        Ok(())
    }

    pub fn get_feed_id_by_name(&self, name: &str) -> Result<Option<FeedId>> {
        let conn = self.conn();
        let id: Option<String> = conn
            .query_row(
                "SELECT feed_id FROM feed_names WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        id.map(|s| FeedId::parse(&s)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_key_roundtrip() {
        let store = FeedStore::open_memory().unwrap();
        let key = Identity::generate();
        let feed_id = FeedId::from_identity(&key);

        assert!(!store.has_writeable_feed(&feed_id).unwrap());
        store.add_feed_key(&feed_id, &key).unwrap();

        let loaded = store.get_feed_key(&feed_id).unwrap().unwrap();
        assert_eq!(loaded.verifying_key(), key.verifying_key());
        assert!(store.has_feed(&feed_id).unwrap());
        assert!(store.has_writeable_feed(&feed_id).unwrap());
    }

    #[test]
    fn names_follow_feed_deletion() {
        let store = FeedStore::open_memory().unwrap();
        let key = Identity::generate();
        let feed_id = FeedId::from_identity(&key);
        store.add_feed_key(&feed_id, &key).unwrap();
        store.set_feed_name("notes", &feed_id).unwrap();

        assert_eq!(store.get_feed_id_by_name("notes").unwrap(), Some(feed_id.clone()));
        assert_eq!(store.get_feed_id_by_name("other").unwrap(), None);

        store.delete_feed(&feed_id).unwrap();
        assert_eq!(store.get_feed_id_by_name("notes").unwrap(), None);
        assert!(!store.has_writeable_feed(&feed_id).unwrap());
    }

    #[test]
    fn renaming_points_to_latest_feed() {
        let store = FeedStore::open_memory().unwrap();
        let a = Identity::generate();
        let b = Identity::generate();
        let (id_a, id_b) = (FeedId::from_identity(&a), FeedId::from_identity(&b));
        store.add_feed_key(&id_a, &a).unwrap();
        store.add_feed_key(&id_b, &b).unwrap();

        store.set_feed_name("main", &id_a).unwrap();
        store.set_feed_name("main", &id_b).unwrap();
        assert_eq!(store.get_feed_id_by_name("main").unwrap(), Some(id_b));
    }
}
