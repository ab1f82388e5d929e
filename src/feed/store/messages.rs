//! Subfeed message storage: contiguous append and ordered read.
//!
//! Rows store the canonical JSON of the signed message. Positions are the
//! compound primary key's last column and must be gapless from 0.

use rusqlite::{params, TransactionBehavior};

use crate::error::{FeedError, Result};
use crate::feed::models::{FeedId, SignedSubfeedMessage, SubfeedHash};
use crate::identity::canonical_json;

use super::FeedStore;

impl FeedStore {
    // ---- Subfeed message operations ----

    /// Append entries to a subfeed. The first entry must sit exactly at the
    /// current stored count and the rest must follow without gaps.
    ///
    /// Runs in one `Immediate` transaction that also ensures the feed and
    /// subfeed rows, so the count read and the inserts cannot interleave
    /// with another writer.
    pub fn append_signed_messages(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        messages: &[SignedSubfeedMessage],
    ) -> Result<u64> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT OR IGNORE INTO feeds (feed_id) VALUES (?1)",
            params![feed_id.as_str()],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO subfeeds (feed_id, subfeed_hash) VALUES (?1, ?2)",
            params![feed_id.as_str(), subfeed_hash.as_str()],
        )?;

        let mut expected: u64 = tx.query_row(
            "SELECT COUNT(*) FROM subfeed_messages WHERE feed_id = ?1 AND subfeed_hash = ?2",
            params![feed_id.as_str(), subfeed_hash.as_str()],
            |row| row.get(0),
        )?;

        for msg in messages {
            let position = msg.position();
            if position != expected {
                return Err(FeedError::PositionGap {
                    expected,
                    found: position,
                });
            }
            let json = String::from_utf8(canonical_json(msg)?).map_err(|e| {
                FeedError::FeedIntegrity {
                    reason: format!("non-utf8 message encoding: {e}"),
                }
            })?;
            tx.execute(
                "INSERT INTO subfeed_messages (feed_id, subfeed_hash, position, message)
                 VALUES (?1, ?2, ?3, ?4)",
                params![feed_id.as_str(), subfeed_hash.as_str(), position, json],
            )?;
            expected += 1;
        }

        tx.commit()?;
        Ok(expected)
    }

    /// All entries of a subfeed in position order. Empty if the subfeed is
    /// unknown.
    pub fn get_signed_messages(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
    ) -> Result<Vec<SignedSubfeedMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT position, message FROM subfeed_messages
             WHERE feed_id = ?1 AND subfeed_hash = ?2
             ORDER BY position ASC",
        )?;
        let rows = stmt
            .query_map(params![feed_id.as_str(), subfeed_hash.as_str()], |row| {
                Ok((row.get::<_, u64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (index, (position, json)) in rows.into_iter().enumerate() {
            let msg: SignedSubfeedMessage =
                serde_json::from_str(&json).map_err(|e| FeedError::FeedIntegrity {
                    reason: format!(
                        "undecodable message at {feed_id}/{subfeed_hash}/{position}: {e}"
                    ),
                })?;
            if position != index as u64 || msg.position() != position {
                return Err(FeedError::FeedIntegrity {
                    reason: format!(
                        "stored position {position} out of sequence for {feed_id}/{subfeed_hash}"
                    ),
                });
            }
            out.push(msg);
        }
        Ok(out)
    }

    pub fn count_signed_messages(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
    ) -> Result<u64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM subfeed_messages WHERE feed_id = ?1 AND subfeed_hash = ?2",
            params![feed_id.as_str(), subfeed_hash.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Overwrite one stored row. Test-only hook for corruption scenarios.
    #[cfg(test)]
    pub(crate) fn overwrite_raw_message(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        position: u64,
        raw: &str,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE subfeed_messages SET message = ?4
             WHERE feed_id = ?1 AND subfeed_hash = ?2 AND position = ?3",
            params![feed_id.as_str(), subfeed_hash.as_str(), position, raw],
        )?;
        Ok(())
    }
}
