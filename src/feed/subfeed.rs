//! Subfeed aggregate: initialization, write path, read/wait path and remote
//! sync coordination for one (feed, subfeed) in one channel scope.
//!
//! Several `Subfeed` instances may exist for the same (feed, subfeed), one
//! per scope. They share a single [`SubfeedLog`], so entries written through
//! any instance are visible to all of them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::OnceCell;

use crate::error::{FeedError, Result};
use crate::feed::chain::sign_messages;
use crate::feed::log::SubfeedLog;
use crate::feed::models::{ChannelName, ChannelScope, SignedSubfeedMessage, SubfeedKey};
use crate::feed::store::FeedStore;
use crate::hub::ChannelHub;
use crate::identity::Identity;
use crate::replication::incoming::{upload_subfeed, IncomingConnections};
use crate::replication::{
    IncomingSubfeedConnection, OutgoingSubfeedConnection, RemoteSubfeedMessageDownloader,
    SyncTimings,
};

/// Whether this node can sign new entries for the feed.
#[derive(Clone)]
pub enum SubfeedHandle {
    ReadOnly,
    Writable(Identity),
}

impl SubfeedHandle {
    pub fn is_writeable(&self) -> bool {
        matches!(self, SubfeedHandle::Writable(_))
    }
}

impl std::fmt::Debug for SubfeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubfeedHandle::ReadOnly => f.write_str("ReadOnly"),
            SubfeedHandle::Writable(_) => f.write_str("Writable"),
        }
    }
}

/// State shared by every scope instance of one (feed, subfeed): the log and
/// the uploaders serving requesting channels.
#[derive(Clone)]
pub struct SharedSubfeed {
    pub log: Arc<SubfeedLog>,
    pub incoming: Arc<IncomingConnections>,
}

impl SharedSubfeed {
    pub fn new(log: Arc<SubfeedLog>) -> Self {
        Self {
            log,
            incoming: Arc::new(IncomingConnections::new()),
        }
    }
}

pub struct Subfeed {
    key: SubfeedKey,
    scope: ChannelScope,
    log: Arc<SubfeedLog>,
    store: FeedStore,
    hub: Arc<ChannelHub>,
    timings: SyncTimings,
    init: OnceCell<std::result::Result<SubfeedHandle, String>>,
    outgoing: Option<OutgoingSubfeedConnection>,
    downloader: Option<RemoteSubfeedMessageDownloader>,
    incoming: Arc<IncomingConnections>,
}

impl Subfeed {
    /// Build an uninitialized subfeed. A remote scope must name a channel
    /// this node is a member of.
    pub fn new(
        shared: SharedSubfeed,
        scope: ChannelScope,
        store: FeedStore,
        hub: Arc<ChannelHub>,
        timings: SyncTimings,
    ) -> Result<Self> {
        let SharedSubfeed { log, incoming } = shared;
        let key = log.key().clone();
        let (outgoing, downloader) = match &scope {
            ChannelScope::Local => (None, None),
            ChannelScope::Remote(channel) => {
                let bucket = hub.bucket(channel)?.clone();
                let outgoing = OutgoingSubfeedConnection::new(
                    key.clone(),
                    channel.clone(),
                    hub.clone(),
                    timings.request_interval(),
                );
                let downloader = RemoteSubfeedMessageDownloader::new(log.clone(), bucket);
                (Some(outgoing), Some(downloader))
            }
        };
        Ok(Self {
            key,
            scope,
            log,
            store,
            hub,
            timings,
            init: OnceCell::new(),
            outgoing,
            downloader,
            incoming,
        })
    }

    pub fn key(&self) -> &SubfeedKey {
        &self.key
    }

    /// Initialize once. Concurrent callers share one attempt; a failure is
    /// returned to every current and future caller.
    pub async fn initialize(&self) -> Result<&SubfeedHandle> {
        let outcome = self
            .init
            .get_or_init(|| async {
                self.run_initialization().await.map_err(|e| {
                    tracing::error!(
                        subfeed = %self.key,
                        scope = %self.scope,
                        error = %e,
                        "subfeed initialization failed"
                    );
                    e.to_string()
                })
            })
            .await;
        match outcome {
            Ok(handle) => Ok(handle),
            Err(reason) => Err(FeedError::Initialization {
                reason: reason.clone(),
            }),
        }
    }

    async fn run_initialization(&self) -> Result<SubfeedHandle> {
        let store = self.store.clone();
        let feed_id = self.key.feed_id.clone();
        let feed_key = tokio::task::spawn_blocking(move || store.get_feed_key(&feed_id)).await??;
        let handle = match feed_key {
            Some(identity) => SubfeedHandle::Writable(identity),
            None => SubfeedHandle::ReadOnly,
        };

        self.log.load().await?;

        if let Some(downloader) = &self.downloader {
            if let Err(e) = downloader.catch_up(|fresh| self.ingest(fresh)).await {
                tracing::warn!(
                    subfeed = %self.key,
                    scope = %self.scope,
                    error = %e,
                    "initial bucket catch-up failed"
                );
            }
        }

        tracing::debug!(
            subfeed = %self.key,
            scope = %self.scope,
            count = self.log.count(),
            writeable = handle.is_writeable(),
            "subfeed initialized"
        );
        Ok(handle)
    }

    pub async fn is_writeable(&self) -> Result<bool> {
        Ok(self.initialize().await?.is_writeable())
    }

    pub fn get_num_local_messages(&self) -> u64 {
        self.log.count()
    }

    /// Sign and append `payloads`. Returns the new message count.
    pub async fn append_messages(
        &self,
        payloads: Vec<serde_json::Value>,
        meta_data: Option<serde_json::Value>,
    ) -> Result<u64> {
        let SubfeedHandle::Writable(feed_key) = self.initialize().await? else {
            return Err(FeedError::NotWriteable {
                feed_id: self.key.feed_id.to_string(),
            });
        };
        if payloads.is_empty() {
            return Ok(self.log.count());
        }

        let num = payloads.len();
        let timestamp = Utc::now().timestamp_millis();
        let count = self
            .log
            .append_with(|tail| sign_messages(feed_key, tail, payloads, meta_data, timestamp))
            .await?;
        tracing::debug!(subfeed = %self.key, appended = num, count, "appended messages");
        self.prune_incoming();
        Ok(count)
    }

    /// Append entries signed elsewhere. Already-held positions are skipped;
    /// anything that does not extend the chain rejects the whole batch.
    pub async fn add_signed_messages(&self, entries: Vec<SignedSubfeedMessage>) -> Result<usize> {
        self.initialize().await?;
        self.ingest(entries).await
    }

    // Does not initialize: also runs from inside initialization.
    async fn ingest(&self, entries: Vec<SignedSubfeedMessage>) -> Result<usize> {
        let added = self.log.extend_verified(entries).await?;
        if added > 0 {
            self.prune_incoming();
        }
        Ok(added)
    }

    pub async fn get_signed_messages(
        &self,
        position: u64,
        max_count: usize,
    ) -> Result<Vec<SignedSubfeedMessage>> {
        self.initialize().await?;
        Ok(self.log.read(position, max_count))
    }

    /// Cached entries without initializing. Empty before `initialize`.
    pub fn read(&self, position: u64, max_count: usize) -> Vec<SignedSubfeedMessage> {
        self.log.read(position, max_count)
    }

    /// Entries from `position`, waiting up to `wait` for the first one to
    /// arrive. Empty on timeout.
    pub async fn wait_for_signed_messages(
        &self,
        position: u64,
        max_count: usize,
        wait: Duration,
    ) -> Result<Vec<SignedSubfeedMessage>> {
        self.initialize().await?;
        let mut counts = self.log.subscribe();
        if self.log.count() > position {
            return Ok(self.log.read(position, max_count));
        }
        if wait.is_zero() {
            return Ok(Vec::new());
        }

        self.renew_outgoing().await;

        let arrived = tokio::time::timeout(wait, counts.wait_for(|count| *count > position))
            .await
            .is_ok_and(|changed| changed.is_ok());
        if !arrived {
            return Ok(Vec::new());
        }
        Ok(self.log.read(position, max_count))
    }

    /// Re-send the subscription request for a remote scope, if due.
    pub async fn renew_outgoing(&self) {
        let Some(outgoing) = &self.outgoing else {
            return;
        };
        if let Err(e) = outgoing.renew(self.log.count()).await {
            tracing::warn!(
                subfeed = %self.key,
                channel = %outgoing.channel(),
                error = %e,
                "failed to request subfeed"
            );
        }
    }

    /// A node on `channel` asked for this subfeed and holds `position`
    /// messages.
    pub async fn handle_incoming_subscription(
        &self,
        channel: &ChannelName,
        position: u64,
    ) -> Result<()> {
        self.initialize().await?;
        let bucket = self.hub.bucket(channel)?.clone();
        self.incoming
            .handle_request(&self.key, channel, position, || {
                IncomingSubfeedConnection::spawn(
                    self.log.clone(),
                    bucket,
                    self.hub.clone(),
                    self.timings,
                )
            });
        Ok(())
    }

    /// The bucket of this subfeed's remote channel now holds `count`
    /// messages. Returns how many entries were downloaded.
    pub async fn report_num_remote_messages(&self, count: u64) -> Result<usize> {
        self.initialize().await?;
        match &self.downloader {
            Some(downloader) => {
                downloader
                    .report_num_remote_messages(count, |fresh| self.add_signed_messages(fresh))
                    .await
            }
            None => Ok(0),
        }
    }

    /// Publish local entries to `channel`'s bucket. Returns the count the
    /// bucket now covers.
    pub async fn upload_to_channel(&self, channel: &ChannelName) -> Result<u64> {
        self.initialize().await?;
        upload_subfeed(&self.log, self.hub.bucket(channel)?).await
    }

    /// Uploaders currently held for this subfeed, across all scopes. Expired
    /// ones count until the next message arrival or request evicts them.
    pub fn num_incoming_connections(&self) -> usize {
        self.incoming.len()
    }

    // Connections are shared by every scope, so an arrival through any scope
    // evicts them all.
    fn prune_incoming(&self) {
        self.incoming.prune(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::chain::ChainTail;
    use crate::feed::models::{FeedId, SubfeedHash};
    use crate::hub::bucket::SubfeedBucket;
    use crate::hub::pubsub::{InMemoryPubsub, PubsubMessageBody};
    use object_store::memory::InMemory;
    use object_store::ObjectStore;
    use serde_json::json;
    use std::time::Instant;

    struct Fixture {
        store: FeedStore,
        hub: Arc<ChannelHub>,
        bucket_store: Arc<dyn ObjectStore>,
        feed_key: Identity,
        key: SubfeedKey,
    }

    fn lab() -> ChannelName {
        ChannelName::parse("lab").unwrap()
    }

    fn fixture() -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("feedmesh=debug")
            .try_init();
        let bucket_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let hub = ChannelHub::new(Identity::generate(), Arc::new(InMemoryPubsub::new(16)))
            .with_channel(lab(), bucket_store.clone(), true, true);
        let feed_key = Identity::generate();
        let key = SubfeedKey::new(
            FeedId::from_identity(&feed_key),
            SubfeedHash::parse("abcdef").unwrap(),
        );
        Fixture {
            store: FeedStore::open_memory().unwrap(),
            hub: Arc::new(hub),
            bucket_store,
            feed_key,
            key,
        }
    }

    impl Fixture {
        fn shared(&self) -> SharedSubfeed {
            SharedSubfeed::new(Arc::new(
                SubfeedLog::new(self.key.clone(), self.store.clone()).unwrap(),
            ))
        }

        fn subfeed(&self, scope: ChannelScope) -> Subfeed {
            self.scoped(&self.shared(), scope)
        }

        fn scoped(&self, shared: &SharedSubfeed, scope: ChannelScope) -> Subfeed {
            Subfeed::new(
                shared.clone(),
                scope,
                self.store.clone(),
                self.hub.clone(),
                SyncTimings::fast(),
            )
            .unwrap()
        }

        fn make_writeable(&self) {
            self.store
                .add_feed_key(&self.key.feed_id, &self.feed_key)
                .unwrap();
        }
    }

    #[tokio::test]
    async fn writable_append_and_read() {
        let fx = fixture();
        fx.make_writeable();
        let subfeed = fx.subfeed(ChannelScope::Local);

        assert!(subfeed.is_writeable().await.unwrap());
        let count = subfeed
            .append_messages(vec![json!({"a": 1}), json!({"a": 2})], Some(json!({"k": "v"})))
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(subfeed.append_messages(vec![], None).await.unwrap(), 2);

        let msgs = subfeed.get_signed_messages(1, 10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body.message, json!({"a": 2}));
        assert_eq!(msgs[0].body.meta_data, Some(json!({"k": "v"})));
        assert_eq!(
            msgs[0].body.previous_signature,
            subfeed.get_signed_messages(0, 1).await.unwrap()[0].signature.clone().into()
        );
    }

    #[tokio::test]
    async fn read_only_append_rejected() {
        let fx = fixture();
        let subfeed = fx.subfeed(ChannelScope::Local);
        let err = subfeed.append_messages(vec![json!(1)], None).await.unwrap_err();
        assert!(matches!(err, FeedError::NotWriteable { .. }));
        assert_eq!(subfeed.get_num_local_messages(), 0);
    }

    #[tokio::test]
    async fn add_signed_messages_is_idempotent() {
        let fx = fixture();
        let subfeed = fx.subfeed(ChannelScope::Local);
        let entries = sign_messages(
            &fx.feed_key,
            &ChainTail::default(),
            vec![json!("a"), json!("b"), json!("c")],
            None,
            1,
        )
        .unwrap();

        assert_eq!(subfeed.add_signed_messages(entries[..2].to_vec()).await.unwrap(), 2);
        assert_eq!(subfeed.add_signed_messages(entries[..2].to_vec()).await.unwrap(), 0);
        assert_eq!(subfeed.add_signed_messages(entries.clone()).await.unwrap(), 1);
        assert_eq!(subfeed.get_signed_messages(0, 10).await.unwrap(), entries);
    }

    #[tokio::test]
    async fn appends_chain_across_batches() {
        let fx = fixture();
        fx.make_writeable();
        let subfeed = fx.subfeed(ChannelScope::Local);
        subfeed
            .append_messages(vec![json!("a"), json!("b")], None)
            .await
            .unwrap();
        assert_eq!(subfeed.append_messages(vec![json!("c")], None).await.unwrap(), 3);

        let msgs = subfeed.get_signed_messages(0, 10).await.unwrap();
        let positions: Vec<u64> = msgs.iter().map(|m| m.position()).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        let bodies: Vec<_> = msgs.iter().map(|m| m.body.message.clone()).collect();
        assert_eq!(bodies, vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(msgs[0].body.previous_signature, None);
        assert_eq!(msgs[1].body.previous_signature.as_deref(), Some(msgs[0].signature.as_str()));
        assert_eq!(msgs[2].body.previous_signature.as_deref(), Some(msgs[1].signature.as_str()));
    }

    #[tokio::test]
    async fn wait_past_end_returns_empty() {
        let fx = fixture();
        fx.make_writeable();
        let subfeed = fx.subfeed(ChannelScope::Local);
        subfeed
            .append_messages(vec![json!(1), json!(2), json!(3)], None)
            .await
            .unwrap();

        let started = Instant::now();
        let got = subfeed
            .wait_for_signed_messages(5, 10, Duration::from_millis(150))
            .await
            .unwrap();
        assert!(got.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(140));
        assert_eq!(subfeed.get_num_local_messages(), 3);
    }

    #[tokio::test]
    async fn zero_wait_on_remote_scope_sends_no_request() {
        let fx = fixture();
        let mut deliveries = fx.hub.subscribe();
        let subfeed = fx.subfeed(ChannelScope::Remote(lab()));

        let got = subfeed
            .wait_for_signed_messages(0, 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(got.is_empty());
        assert!(deliveries.try_recv().is_err());

        subfeed
            .wait_for_signed_messages(0, 10, Duration::from_millis(20))
            .await
            .unwrap();
        let delivery = deliveries.try_recv().unwrap();
        assert!(matches!(
            delivery.message.body,
            PubsubMessageBody::RequestSubfeed { position: 0, .. }
        ));
    }

    #[tokio::test]
    async fn wait_times_out_empty() {
        let fx = fixture();
        let subfeed = fx.subfeed(ChannelScope::Local);
        let started = Instant::now();
        let got = subfeed
            .wait_for_signed_messages(0, 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(got.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test]
    async fn wait_wakes_on_append_from_other_scope() {
        let fx = fixture();
        fx.make_writeable();
        let shared = fx.shared();
        let local = Arc::new(fx.scoped(&shared, ChannelScope::Local));
        let remote = fx.scoped(&shared, ChannelScope::Remote(lab()));
        remote.initialize().await.unwrap();

        let writer = local.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.append_messages(vec![json!("late")], None).await.unwrap();
        });

        let got = remote
            .wait_for_signed_messages(0, 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body.message, json!("late"));
    }

    #[tokio::test]
    async fn corrupt_store_fails_every_caller() {
        let fx = fixture();
        let mut entries = sign_messages(
            &fx.feed_key,
            &ChainTail::default(),
            vec![json!("a"), json!("b")],
            None,
            1,
        )
        .unwrap();
        entries[1].body.previous_signature = None;
        fx.store
            .append_signed_messages(&fx.key.feed_id, &fx.key.subfeed_hash, &entries)
            .unwrap();

        let subfeed = Arc::new(fx.subfeed(ChannelScope::Local));
        let a = {
            let s = subfeed.clone();
            tokio::spawn(async move { s.get_signed_messages(0, 1).await.map(|_| ()) })
        };
        let b = {
            let s = subfeed.clone();
            tokio::spawn(async move { s.wait_for_signed_messages(0, 1, Duration::ZERO).await.map(|_| ()) })
        };
        for result in [a.await.unwrap(), b.await.unwrap()] {
            assert!(matches!(result, Err(FeedError::Initialization { .. })));
        }
        assert!(matches!(
            subfeed.append_messages(vec![json!(1)], None).await,
            Err(FeedError::Initialization { .. })
        ));
    }

    #[tokio::test]
    async fn remote_scope_catches_up_at_init() {
        let fx = fixture();
        let entries = sign_messages(
            &fx.feed_key,
            &ChainTail::default(),
            vec![json!(1), json!(2), json!(3)],
            None,
            1,
        )
        .unwrap();
        SubfeedBucket::new(fx.bucket_store.clone(), lab())
            .upload(&fx.key.feed_id, &fx.key.subfeed_hash, &entries)
            .await
            .unwrap();

        let subfeed = fx.subfeed(ChannelScope::Remote(lab()));
        assert_eq!(subfeed.get_signed_messages(0, 10).await.unwrap(), entries);
        assert_eq!(subfeed.report_num_remote_messages(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upload_to_channel_publishes_local_entries() {
        let fx = fixture();
        fx.make_writeable();
        let subfeed = fx.subfeed(ChannelScope::Local);
        subfeed
            .append_messages(vec![json!("x"), json!("y")], None)
            .await
            .unwrap();

        assert_eq!(subfeed.upload_to_channel(&lab()).await.unwrap(), 2);
        let bucket = SubfeedBucket::new(fx.bucket_store.clone(), lab());
        assert_eq!(
            bucket
                .load_watermark(&fx.key.feed_id, &fx.key.subfeed_hash)
                .await
                .unwrap(),
            Some(2)
        );
    }

    #[tokio::test]
    async fn incoming_subscription_opens_one_connection_per_channel() {
        let fx = fixture();
        let subfeed = fx.subfeed(ChannelScope::Remote(lab()));
        subfeed.handle_incoming_subscription(&lab(), 0).await.unwrap();
        subfeed.handle_incoming_subscription(&lab(), 0).await.unwrap();
        assert_eq!(subfeed.num_incoming_connections(), 1);

        let other = ChannelName::parse("other").unwrap();
        assert!(matches!(
            subfeed.handle_incoming_subscription(&other, 0).await,
            Err(FeedError::UnknownChannel { .. })
        ));
    }

    #[tokio::test]
    async fn append_through_local_scope_evicts_expired_uploaders() {
        let fx = fixture();
        fx.make_writeable();
        let shared = fx.shared();
        let local = fx.scoped(&shared, ChannelScope::Local);
        let remote = fx.scoped(&shared, ChannelScope::Remote(lab()));

        remote.handle_incoming_subscription(&lab(), 5).await.unwrap();
        assert_eq!(local.num_incoming_connections(), 1);

        // Requester silent past the expiry window.
        tokio::time::sleep(SyncTimings::fast().incoming_expiry + Duration::from_millis(200)).await;
        local.append_messages(vec![json!("tick")], None).await.unwrap();

        assert_eq!(shared.incoming.len(), 0);
        assert_eq!(remote.num_incoming_connections(), 0);
    }

    #[tokio::test]
    async fn announced_count_downloads_through_remote_scope() {
        let fx = fixture();
        let subfeed = fx.subfeed(ChannelScope::Remote(lab()));
        subfeed.initialize().await.unwrap();
        assert_eq!(subfeed.get_num_local_messages(), 0);

        let entries = sign_messages(
            &fx.feed_key,
            &ChainTail::default(),
            vec![json!("p"), json!("q")],
            None,
            1,
        )
        .unwrap();
        SubfeedBucket::new(fx.bucket_store.clone(), lab())
            .upload(&fx.key.feed_id, &fx.key.subfeed_hash, &entries)
            .await
            .unwrap();

        assert_eq!(subfeed.report_num_remote_messages(2).await.unwrap(), 2);
        assert_eq!(subfeed.get_signed_messages(0, 10).await.unwrap(), entries);
        assert_eq!(subfeed.report_num_remote_messages(2).await.unwrap(), 0);
    }

    #[test]
    fn unknown_remote_channel_rejected() {
        let fx = fixture();
        let result = Subfeed::new(
            fx.shared(),
            ChannelScope::Remote(ChannelName::parse("nowhere").unwrap()),
            fx.store.clone(),
            fx.hub.clone(),
            SyncTimings::fast(),
        );
        assert!(matches!(result, Err(FeedError::UnknownChannel { .. })));
    }
}
