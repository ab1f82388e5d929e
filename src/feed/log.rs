//! In-memory read-through cache of one subfeed's entries.
//!
//! A `SubfeedLog` is shared by every `Subfeed` instance of the same
//! (feed, subfeed), whatever channel scope those instances are attached to,
//! so a local append is visible to the instance serving a remote channel.
//!
//! Mutations go through one async mutex held across the SQLite transaction.
//! Readers take a short `RwLock` read and never wait on the mutation lock.
//! The message count is published on a `watch` channel after every commit.

use std::sync::RwLock;

use ed25519_dalek::VerifyingKey;
use tokio::sync::{watch, Mutex, OnceCell};

use crate::error::{FeedError, Result};
use crate::feed::chain::{verify_chain, ChainTail};
use crate::feed::models::{SignedSubfeedMessage, SubfeedKey};
use crate::feed::store::FeedStore;

pub struct SubfeedLog {
    key: SubfeedKey,
    public_key: VerifyingKey,
    store: FeedStore,
    loaded: OnceCell<std::result::Result<(), String>>,
    entries: RwLock<Vec<SignedSubfeedMessage>>,
    write_lock: Mutex<()>,
    count_tx: watch::Sender<u64>,
}

impl SubfeedLog {
    pub fn new(key: SubfeedKey, store: FeedStore) -> Result<Self> {
        let public_key = key.feed_id.verifying_key()?;
        let (count_tx, _) = watch::channel(0);
        Ok(Self {
            key,
            public_key,
            store,
            loaded: OnceCell::new(),
            entries: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
            count_tx,
        })
    }

    pub fn key(&self) -> &SubfeedKey {
        &self.key
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    /// Load stored entries once, verifying the whole chain. Concurrent
    /// callers share one load; a failed load fails every caller.
    pub async fn load(&self) -> Result<()> {
        let outcome = self
            .loaded
            .get_or_init(|| async {
                self.load_from_store().await.map_err(|e| {
                    tracing::error!(subfeed = %self.key, error = %e, "failed to load subfeed");
                    e.to_string()
                })
            })
            .await;
        outcome
            .clone()
            .map_err(|reason| FeedError::Initialization { reason })
    }

    async fn load_from_store(&self) -> Result<()> {
        let store = self.store.clone();
        let key = self.key.clone();
        let stored = tokio::task::spawn_blocking(move || {
            store.get_signed_messages(&key.feed_id, &key.subfeed_hash)
        })
        .await??;

        verify_chain(&self.public_key, &ChainTail::default(), &stored)?;

        let count = stored.len() as u64;
        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = stored;
        self.count_tx.send_replace(count);
        tracing::debug!(subfeed = %self.key, count, "loaded subfeed from store");
        Ok(())
    }

    pub fn count(&self) -> u64 {
        *self.count_tx.borrow()
    }

    /// Receiver of the message count; changes after every commit.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.count_tx.subscribe()
    }

    /// Up to `max_count` entries starting at `position`.
    pub fn read(&self, position: u64, max_count: usize) -> Vec<SignedSubfeedMessage> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let start = usize::try_from(position).unwrap_or(usize::MAX).min(entries.len());
        let end = start.saturating_add(max_count).min(entries.len());
        entries[start..end].to_vec()
    }

    fn tail(&self) -> ChainTail {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        ChainTail::of(&entries)
    }

    /// Build entries from the current tail and persist them.
    pub async fn append_with<F>(&self, build: F) -> Result<u64>
    where
        F: FnOnce(&ChainTail) -> Result<Vec<SignedSubfeedMessage>>,
    {
        let _guard = self.write_lock.lock().await;
        let entries = build(&self.tail())?;
        self.persist_locked(entries).await
    }

    /// Accept externally signed entries. Positions already held are dropped
    /// from the head of the batch; the rest must extend the current tail or
    /// the whole batch is rejected. Returns how many entries were added.
    pub async fn extend_verified(&self, batch: Vec<SignedSubfeedMessage>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let tail = self.tail();

        let first = match batch.first() {
            Some(m) => m.position(),
            None => return Ok(0),
        };
        let skip = usize::try_from(tail.count.saturating_sub(first)).unwrap_or(usize::MAX);
        let fresh: Vec<SignedSubfeedMessage> = batch.into_iter().skip(skip).collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        verify_chain(&self.public_key, &tail, &fresh)?;
        let added = fresh.len();
        self.persist_locked(fresh).await?;
        Ok(added)
    }

    // Caller holds `write_lock`.
    async fn persist_locked(&self, entries: Vec<SignedSubfeedMessage>) -> Result<u64> {
        if entries.is_empty() {
            return Ok(self.count());
        }
        let store = self.store.clone();
        let key = self.key.clone();
        let (result, entries) = tokio::task::spawn_blocking(move || {
            let r = store.append_signed_messages(&key.feed_id, &key.subfeed_hash, &entries);
            (r, entries)
        })
        .await?;
        let stored_count = result?;

        let count = {
            let mut cache = self.entries.write().unwrap_or_else(|e| e.into_inner());
            cache.extend(entries);
            cache.len() as u64
        };
        if count != stored_count {
            return Err(FeedError::FeedIntegrity {
                reason: format!(
                    "cache and store disagree for {}: {count} != {stored_count}",
                    self.key
                ),
            });
        }
        self.count_tx.send_replace(count);
        Ok(count)
    }
}
