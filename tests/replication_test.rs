//! Two-node replication through a shared bucket and the in-process pub/sub bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use feedmesh::error::FeedError;
use feedmesh::feed::models::{ChannelName, FeedId, SubfeedHash};
use feedmesh::feed::store::FeedStore;
use feedmesh::feed::{FeedManager, SubfeedWatch};
use feedmesh::hub::pubsub::InMemoryPubsub;
use feedmesh::hub::ChannelHub;
use feedmesh::identity::Identity;
use feedmesh::replication::SyncTimings;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn lab() -> ChannelName {
    ChannelName::parse("lab").unwrap()
}

fn subfeed_hash() -> SubfeedHash {
    SubfeedHash::parse("c0ffee").unwrap()
}

struct Node {
    manager: Arc<FeedManager>,
    _cancel: tokio_util::sync::DropGuard,
}

fn start_node(
    pubsub: &InMemoryPubsub,
    bucket: &Arc<dyn ObjectStore>,
    request_feeds: bool,
    provide_feeds: bool,
) -> Node {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("feedmesh=debug")
        .with_test_writer()
        .try_init();
    let hub = ChannelHub::new(Identity::generate(), Arc::new(pubsub.clone())).with_channel(
        lab(),
        bucket.clone(),
        request_feeds,
        provide_feeds,
    );
    let manager = Arc::new(FeedManager::new(
        FeedStore::open_memory().unwrap(),
        Arc::new(hub),
        SyncTimings::fast(),
    ));
    let cancel = CancellationToken::new();
    manager.spawn(cancel.clone());
    Node {
        manager,
        _cancel: cancel.drop_guard(),
    }
}

fn remote_watch(feed_id: &FeedId, position: u64) -> HashMap<String, SubfeedWatch> {
    HashMap::from([(
        "remote".to_string(),
        SubfeedWatch {
            feed_id: feed_id.clone(),
            subfeed_hash: subfeed_hash(),
            position,
            channel: Some(lab()),
        },
    )])
}

#[tokio::test]
async fn watcher_receives_messages_from_provider() {
    let pubsub = InMemoryPubsub::new(256);
    let bucket: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let provider = start_node(&pubsub, &bucket, false, true);
    let watcher = start_node(&pubsub, &bucket, true, false);

    let feed_id = provider.manager.create_feed(Some("sensor".into())).await.unwrap();
    provider
        .manager
        .append_messages(&feed_id, &subfeed_hash(), vec![json!({"t": 1}), json!({"t": 2})], None)
        .await
        .unwrap();

    let found = watcher
        .manager
        .watch_for_new_messages(remote_watch(&feed_id, 0), Duration::from_secs(5), 100)
        .await
        .unwrap();
    let messages = &found["remote"];
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].body.message, json!({"t": 1}));
    assert_eq!(messages[1].body.previous_signature.as_deref(), Some(messages[0].signature.as_str()));

    // The copy is verified and stored locally, but not writeable here.
    assert_eq!(
        watcher
            .manager
            .get_num_local_messages(&feed_id, &subfeed_hash())
            .await
            .unwrap(),
        2
    );
    assert!(!watcher.manager.has_writeable_feed(&feed_id).await.unwrap());
}

#[tokio::test]
async fn later_appends_are_pushed_to_watcher() {
    let pubsub = InMemoryPubsub::new(256);
    let bucket: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let provider = start_node(&pubsub, &bucket, false, true);
    let watcher = start_node(&pubsub, &bucket, true, false);

    let feed_id = provider.manager.create_feed(None).await.unwrap();
    provider
        .manager
        .append_messages(&feed_id, &subfeed_hash(), vec![json!("first")], None)
        .await
        .unwrap();
    let first = watcher
        .manager
        .watch_for_new_messages(remote_watch(&feed_id, 0), Duration::from_secs(5), 100)
        .await
        .unwrap();
    assert_eq!(first["remote"].len(), 1);

    let appender = provider.manager.clone();
    let feed = feed_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        appender
            .append_messages(&feed, &subfeed_hash(), vec![json!("second")], None)
            .await
            .unwrap();
    });

    let second = watcher
        .manager
        .watch_for_new_messages(remote_watch(&feed_id, 1), Duration::from_secs(5), 100)
        .await
        .unwrap();
    let messages = &second["remote"];
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].position(), 1);
    assert_eq!(messages[0].body.message, json!("second"));
}

#[tokio::test]
async fn no_provider_means_empty_watch() {
    let pubsub = InMemoryPubsub::new(256);
    let bucket: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    // Has the feed, but does not provide on the channel.
    let owner = start_node(&pubsub, &bucket, true, false);
    let watcher = start_node(&pubsub, &bucket, true, false);

    let feed_id = owner.manager.create_feed(None).await.unwrap();
    owner
        .manager
        .append_messages(&feed_id, &subfeed_hash(), vec![json!(1)], None)
        .await
        .unwrap();

    let found = watcher
        .manager
        .watch_for_new_messages(remote_watch(&feed_id, 0), Duration::from_millis(300), 100)
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn watch_on_unjoined_channel_fails() {
    let pubsub = InMemoryPubsub::new(16);
    let bucket: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let node = start_node(&pubsub, &bucket, true, true);
    let feed_id = FeedId::from_identity(&Identity::generate());

    let watches = HashMap::from([(
        "w".to_string(),
        SubfeedWatch {
            feed_id,
            subfeed_hash: subfeed_hash(),
            position: 0,
            channel: Some(ChannelName::parse("elsewhere").unwrap()),
        },
    )]);
    let err = node
        .manager
        .watch_for_new_messages(watches, Duration::from_millis(50), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::UnknownChannel { .. }));
}

#[tokio::test]
async fn status_counts_subscriptions() {
    let pubsub = InMemoryPubsub::new(256);
    let bucket: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let provider = start_node(&pubsub, &bucket, false, true);
    let watcher = start_node(&pubsub, &bucket, true, false);

    let feed_id = provider.manager.create_feed(None).await.unwrap();
    provider
        .manager
        .append_messages(&feed_id, &subfeed_hash(), vec![json!(1)], None)
        .await
        .unwrap();
    watcher
        .manager
        .watch_for_new_messages(remote_watch(&feed_id, 0), Duration::from_secs(5), 10)
        .await
        .unwrap();

    let status = watcher.manager.status().await.unwrap();
    assert_eq!(status.outgoing_subscriptions, 1);
    assert_eq!(status.channels.len(), 1);
    assert!(status.channels[0].request_feeds);

    let status = provider.manager.status().await.unwrap();
    assert_eq!(status.incoming_subscriptions, 1);
    assert_eq!(status.feed_count, 1);
}
