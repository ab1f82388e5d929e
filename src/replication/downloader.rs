//! Bulk catch-up of a remote subfeed from a channel bucket.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{FeedError, Result};
use crate::feed::chain::verify_message;
use crate::feed::log::SubfeedLog;
use crate::feed::models::SignedSubfeedMessage;
use crate::hub::bucket::SubfeedBucket;

/// Downloads for one (subfeed, channel). Calls are serialized.
pub struct RemoteSubfeedMessageDownloader {
    log: Arc<SubfeedLog>,
    bucket: SubfeedBucket,
    lock: Mutex<()>,
}

impl RemoteSubfeedMessageDownloader {
    pub fn new(log: Arc<SubfeedLog>, bucket: SubfeedBucket) -> Self {
        Self {
            log,
            bucket,
            lock: Mutex::new(()),
        }
    }

    /// Fetch whatever the channel's watermark advertises beyond the local
    /// count and hand it to `ingest`. Returns how many entries were added.
    pub async fn catch_up<F, Fut>(&self, ingest: F) -> Result<usize>
    where
        F: FnOnce(Vec<SignedSubfeedMessage>) -> Fut,
        Fut: Future<Output = Result<usize>>,
    {
        let key = self.log.key();
        match self
            .bucket
            .load_watermark(&key.feed_id, &key.subfeed_hash)
            .await?
        {
            Some(remote) => self.report_num_remote_messages(remote, ingest).await,
            None => Ok(0),
        }
    }

    /// The channel bucket holds `remote` messages. Download the ones we lack,
    /// verify their signatures and pass them to `ingest`, which appends them
    /// to the log. Returns how many entries were added.
    pub async fn report_num_remote_messages<F, Fut>(&self, remote: u64, ingest: F) -> Result<usize>
    where
        F: FnOnce(Vec<SignedSubfeedMessage>) -> Fut,
        Fut: Future<Output = Result<usize>>,
    {
        let _guard = self.lock.lock().await;
        let key = self.log.key();
        let local = self.log.count();
        if remote <= local {
            return Ok(0);
        }

        let downloaded = self
            .bucket
            .download(&key.feed_id, &key.subfeed_hash, local, remote)
            .await?;
        for entry in &downloaded {
            verify_message(self.log.public_key(), entry).map_err(|_| FeedError::FeedIntegrity {
                reason: format!(
                    "bad signature in {} at position {} from {}",
                    key,
                    entry.position(),
                    self.bucket.channel()
                ),
            })?;
        }

        // Local writes may have landed while we were downloading.
        let now = self.log.count();
        if now < local || now >= remote {
            return Ok(0);
        }
        let skip = usize::try_from(now - local).unwrap_or(usize::MAX);
        let fresh: Vec<_> = downloaded.into_iter().skip(skip).collect();
        let added = ingest(fresh).await?;
        tracing::info!(
            subfeed = %key,
            channel = %self.bucket.channel(),
            added,
            count = self.log.count(),
            "downloaded subfeed messages"
        );
        Ok(added)
    }
}
