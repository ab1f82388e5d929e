//! Subfeed publication in a channel bucket.
//!
//! Layout, relative to the bucket root:
//!
//! ```text
//! <channel>/feeds/<f0f1>/<f2f3>/<f4f5>/<feedId>/subfeeds/<s0s1>/<s2s3>/<s4s5>/<subfeedHash>/<position>
//! <channel>/feeds/.../<subfeedHash>/subfeed.json      {"messageCount": n}
//! ```
//!
//! Uploads write message objects first and the watermark last, so the
//! watermark never advertises an object that was not written. Object bytes
//! are the canonical JSON of the signed message: re-uploading a position
//! writes identical bytes.

use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};

use crate::config::BucketConfig;
use crate::error::{FeedError, Result};
use crate::feed::models::{ChannelName, FeedId, SignedSubfeedMessage, SubfeedHash};
use crate::identity::canonical_json;

/// Largest message count a watermark may advertise (the JSON safe-integer
/// limit shared with other implementations).
pub const MAX_MESSAGE_COUNT: u64 = (1 << 53) - 1;

/// Watermark object contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubfeedJson {
    pub message_count: u64,
}

/// Build an object store from config.
pub fn build_object_store(config: &BucketConfig) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config {
        BucketConfig::Memory => Arc::new(InMemory::new()),

        BucketConfig::Local { path } => {
            std::fs::create_dir_all(path)?;
            Arc::new(LocalFileSystem::new_with_prefix(path)?)
        }

        BucketConfig::S3 {
            bucket,
            region,
            endpoint,
            access_key,
            secret_key,
        } => {
            let mut builder = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .with_region(region.as_deref().unwrap_or("us-east-1"));
            if let Some(endpoint) = endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            if let Some(key) = access_key {
                builder = builder.with_access_key_id(key);
            }
            if let Some(secret) = secret_key {
                builder = builder.with_secret_access_key(secret);
            }
            Arc::new(builder.build()?)
        }
    };
    Ok(store)
}

/// Subfeed objects of one channel inside a bucket.
#[derive(Clone)]
pub struct SubfeedBucket {
    inner: Arc<dyn ObjectStore>,
    channel: ChannelName,
}

impl std::fmt::Debug for SubfeedBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubfeedBucket")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl SubfeedBucket {
    pub fn new(inner: Arc<dyn ObjectStore>, channel: ChannelName) -> Self {
        Self { inner, channel }
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    fn subfeed_dir(&self, feed_id: &FeedId, subfeed_hash: &SubfeedHash) -> String {
        let f = feed_id.as_str();
        let s = subfeed_hash.as_str();
        format!(
            "{}/feeds/{}/{}/{}/{}/subfeeds/{}/{}/{}/{}",
            self.channel,
            &f[0..2],
            &f[2..4],
            &f[4..6],
            f,
            &s[0..2],
            &s[2..4],
            &s[4..6],
            s
        )
    }

    pub fn message_path(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        position: u64,
    ) -> ObjectPath {
        ObjectPath::from(format!(
            "{}/{}",
            self.subfeed_dir(feed_id, subfeed_hash),
            position
        ))
    }

    pub fn watermark_path(&self, feed_id: &FeedId, subfeed_hash: &SubfeedHash) -> ObjectPath {
        ObjectPath::from(format!(
            "{}/subfeed.json",
            self.subfeed_dir(feed_id, subfeed_hash)
        ))
    }

    async fn get_bytes(&self, path: &ObjectPath) -> Result<Option<bytes::Bytes>> {
        match self.inner.get(path).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Published message count, or None if the subfeed was never uploaded.
    pub async fn load_watermark(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
    ) -> Result<Option<u64>> {
        let path = self.watermark_path(feed_id, subfeed_hash);
        let Some(bytes) = self.get_bytes(&path).await? else {
            return Ok(None);
        };
        let json: SubfeedJson =
            serde_json::from_slice(&bytes).map_err(|e| FeedError::StoreInconsistency {
                reason: format!("malformed watermark at {path}: {e}"),
            })?;
        if json.message_count > MAX_MESSAGE_COUNT {
            return Err(FeedError::StoreInconsistency {
                reason: format!("watermark {} at {path} out of range", json.message_count),
            });
        }
        Ok(Some(json.message_count))
    }

    pub async fn put_watermark(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        message_count: u64,
    ) -> Result<()> {
        let path = self.watermark_path(feed_id, subfeed_hash);
        let body = serde_json::to_vec(&SubfeedJson { message_count })?;
        self.inner.put(&path, body.into()).await?;
        Ok(())
    }

    pub async fn put_message(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        message: &SignedSubfeedMessage,
    ) -> Result<()> {
        let path = self.message_path(feed_id, subfeed_hash, message.position());
        let body = canonical_json(message)?;
        self.inner.put(&path, body.into()).await?;
        Ok(())
    }

    /// Publish `messages`, which must start at the current watermark (or
    /// earlier, for a re-upload), then advance the watermark to the end of
    /// the batch. The watermark is written only after every message object.
    pub async fn upload(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        messages: &[SignedSubfeedMessage],
    ) -> Result<u64> {
        let Some(last) = messages.last() else {
            return Ok(self.load_watermark(feed_id, subfeed_hash).await?.unwrap_or(0));
        };
        for message in messages {
            self.put_message(feed_id, subfeed_hash, message).await?;
        }
        let count = last.position() + 1;
        self.put_watermark(feed_id, subfeed_hash, count).await?;
        tracing::debug!(
            channel = %self.channel,
            feed = %feed_id,
            subfeed = %subfeed_hash,
            from = messages[0].position(),
            count,
            "uploaded subfeed messages"
        );
        Ok(count)
    }

    /// Fetch positions `[start, end)`. The watermark must cover `end` and
    /// every object must exist and decode; anything less is a store
    /// inconsistency, never a short read.
    pub async fn download(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        start: u64,
        end: u64,
    ) -> Result<Vec<SignedSubfeedMessage>> {
        let watermark = self
            .load_watermark(feed_id, subfeed_hash)
            .await?
            .ok_or_else(|| FeedError::StoreInconsistency {
                reason: format!("no watermark for {feed_id}/{subfeed_hash} in {}", self.channel),
            })?;
        if watermark < end {
            return Err(FeedError::StoreInconsistency {
                reason: format!(
                    "watermark {watermark} below requested end {end} for {feed_id}/{subfeed_hash}"
                ),
            });
        }

        let mut out = Vec::new();
        for position in start..end {
            let path = self.message_path(feed_id, subfeed_hash, position);
            let bytes = self
                .get_bytes(&path)
                .await?
                .ok_or_else(|| FeedError::StoreInconsistency {
                    reason: format!("missing object {path} below watermark {watermark}"),
                })?;
            let message: SignedSubfeedMessage =
                serde_json::from_slice(&bytes).map_err(|e| FeedError::StoreInconsistency {
                    reason: format!("malformed object {path}: {e}"),
                })?;
            if message.position() != position {
                return Err(FeedError::StoreInconsistency {
                    reason: format!(
                        "object {path} holds position {}",
                        message.position()
                    ),
                });
            }
            out.push(message);
        }
        Ok(out)
    }
}
