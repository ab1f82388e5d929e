//! Channel hub: this node's channel memberships, their buckets, and the
//! pub/sub signaling used for subfeed replication.
//!
//! Roles gate traffic per channel:
//! - `request_feeds`: we send `requestSubfeed` and act on count updates
//! - `provide_feeds`: we act on `requestSubfeed` and upload

pub mod bucket;
pub mod pubsub;

use std::collections::HashMap;
use std::sync::Arc;

use object_store::ObjectStore;
use tokio::sync::broadcast;

use crate::config::ChannelConfig;
use crate::error::{FeedError, Result};
use crate::feed::models::{ChannelName, FeedId, SubfeedHash};
use crate::identity::Identity;

use self::bucket::{build_object_store, SubfeedBucket};
use self::pubsub::{
    PubsubDelivery, PubsubMessageBody, PubsubTransport, SignedPubsubMessage, TopicKind,
};

#[derive(Debug, Clone)]
pub struct ChannelMembership {
    pub bucket: SubfeedBucket,
    pub request_feeds: bool,
    pub provide_feeds: bool,
}

/// A verified pub/sub message addressed to one of our channels.
#[derive(Debug, Clone)]
pub struct HubMessage {
    pub channel: ChannelName,
    pub from_node_id: String,
    pub body: PubsubMessageBody,
}

pub struct ChannelHub {
    node: Identity,
    pubsub: Arc<dyn PubsubTransport>,
    channels: HashMap<ChannelName, ChannelMembership>,
    topics: HashMap<String, (ChannelName, TopicKind)>,
}

impl ChannelHub {
    pub fn new(node: Identity, pubsub: Arc<dyn PubsubTransport>) -> Self {
        Self {
            node,
            pubsub,
            channels: HashMap::new(),
            topics: HashMap::new(),
        }
    }

    /// Add a channel membership.
    pub fn with_channel(
        mut self,
        channel: ChannelName,
        store: Arc<dyn ObjectStore>,
        request_feeds: bool,
        provide_feeds: bool,
    ) -> Self {
        for kind in [TopicKind::RequestFeeds, TopicKind::ProvideFeeds] {
            self.topics
                .insert(kind.topic(&channel), (channel.clone(), kind));
        }
        let membership = ChannelMembership {
            bucket: SubfeedBucket::new(store, channel.clone()),
            request_feeds,
            provide_feeds,
        };
        self.channels.insert(channel, membership);
        self
    }

    pub fn from_config(
        node: Identity,
        pubsub: Arc<dyn PubsubTransport>,
        channels: &[ChannelConfig],
    ) -> Result<Self> {
        let mut hub = Self::new(node, pubsub);
        for cfg in channels {
            let name = ChannelName::parse(&cfg.name)?;
            let store = build_object_store(&cfg.bucket)?;
            tracing::info!(
                channel = %name,
                request_feeds = cfg.request_feeds,
                provide_feeds = cfg.provide_feeds,
                "joined channel"
            );
            hub = hub.with_channel(name, store, cfg.request_feeds, cfg.provide_feeds);
        }
        Ok(hub)
    }

    pub fn node_id(&self) -> String {
        self.node.public_hex()
    }

    pub fn channel_names(&self) -> Vec<ChannelName> {
        let mut names: Vec<_> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    fn membership(&self, channel: &ChannelName) -> Result<&ChannelMembership> {
        self.channels
            .get(channel)
            .ok_or_else(|| FeedError::UnknownChannel {
                channel: channel.to_string(),
            })
    }

    pub fn bucket(&self, channel: &ChannelName) -> Result<&SubfeedBucket> {
        Ok(&self.membership(channel)?.bucket)
    }

    pub fn can_request(&self, channel: &ChannelName) -> bool {
        self.channels.get(channel).is_some_and(|m| m.request_feeds)
    }

    pub fn can_provide(&self, channel: &ChannelName) -> bool {
        self.channels.get(channel).is_some_and(|m| m.provide_feeds)
    }

    async fn publish(&self, channel: &ChannelName, body: PubsubMessageBody) -> Result<()> {
        let topic = body.topic_kind().topic(channel);
        let message = SignedPubsubMessage::sign(&self.node, body)?;
        self.pubsub.publish(&topic, message).await
    }

    /// Ask providers on `channel` for a subfeed, reporting how many
    /// messages we already hold.
    pub async fn request_subfeed(
        &self,
        channel: &ChannelName,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        position: u64,
    ) -> Result<()> {
        if !self.membership(channel)?.request_feeds {
            return Ok(());
        }
        self.publish(
            channel,
            PubsubMessageBody::RequestSubfeed {
                feed_id: feed_id.clone(),
                subfeed_hash: subfeed_hash.clone(),
                position,
            },
        )
        .await
    }

    /// Tell requesters on `channel` how many messages the bucket now holds.
    pub async fn announce_message_count(
        &self,
        channel: &ChannelName,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        message_count: u64,
    ) -> Result<()> {
        self.publish(
            channel,
            PubsubMessageBody::SubfeedMessageCountUpdate {
                feed_id: feed_id.clone(),
                subfeed_hash: subfeed_hash.clone(),
                message_count,
            },
        )
        .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PubsubDelivery> {
        self.pubsub.subscribe()
    }

    /// Filter a raw delivery down to a verified message for one of our
    /// channels. Our own messages, unknown topics, bad signatures, body/topic
    /// mismatches and messages for a role we do not hold are dropped.
    pub fn accept(&self, delivery: PubsubDelivery) -> Option<HubMessage> {
        let (channel, kind) = self.topics.get(&delivery.topic)?;
        let message = delivery.message;
        if message.from_node_id == self.node_id() {
            return None;
        }
        if let Err(e) = message.verify() {
            tracing::warn!(
                topic = %delivery.topic,
                from = %message.from_node_id,
                error = %e,
                "dropping pubsub message with bad signature"
            );
            return None;
        }
        if message.body.topic_kind() != *kind {
            tracing::warn!(topic = %delivery.topic, "unexpected message type for topic");
            return None;
        }
        let allowed = match kind {
            TopicKind::RequestFeeds => self.can_provide(channel),
            TopicKind::ProvideFeeds => self.can_request(channel),
        };
        if !allowed {
            return None;
        }
        Some(HubMessage {
            channel: channel.clone(),
            from_node_id: message.from_node_id,
            body: message.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::pubsub::InMemoryPubsub;
    use object_store::memory::InMemory;

    fn lab() -> ChannelName {
        ChannelName::parse("lab").unwrap()
    }

    fn hub(bus: &InMemoryPubsub, request: bool, provide: bool) -> ChannelHub {
        ChannelHub::new(Identity::generate(), Arc::new(bus.clone())).with_channel(
            lab(),
            Arc::new(InMemory::new()),
            request,
            provide,
        )
    }

    fn ids() -> (FeedId, SubfeedHash) {
        (
            FeedId::from_identity(&Identity::generate()),
            SubfeedHash::parse("a0a0a0").unwrap(),
        )
    }

    #[tokio::test]
    async fn request_reaches_provider() {
        let bus = InMemoryPubsub::new(16);
        let requester = hub(&bus, true, false);
        let provider = hub(&bus, false, true);
        let mut rx = provider.subscribe();
        let (feed, subfeed) = ids();

        requester.request_subfeed(&lab(), &feed, &subfeed, 2).await.unwrap();

        let msg = provider.accept(rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg.channel, lab());
        assert_eq!(msg.from_node_id, requester.node_id());
        assert_eq!(
            msg.body,
            PubsubMessageBody::RequestSubfeed {
                feed_id: feed,
                subfeed_hash: subfeed,
                position: 2
            }
        );
    }

    #[tokio::test]
    async fn own_and_unauthorized_messages_dropped() {
        let bus = InMemoryPubsub::new(16);
        let a = hub(&bus, true, true);
        let b = hub(&bus, true, false);
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();
        let (feed, subfeed) = ids();

        a.request_subfeed(&lab(), &feed, &subfeed, 0).await.unwrap();

        // a hears itself, b does not provide feeds
        assert!(a.accept(rx_a.recv().await.unwrap()).is_none());
        assert!(b.accept(rx_b.recv().await.unwrap()).is_none());
    }

    #[tokio::test]
    async fn request_skipped_without_role() {
        let bus = InMemoryPubsub::new(16);
        let quiet = hub(&bus, false, true);
        let mut rx = bus.subscribe();
        let (feed, subfeed) = ids();

        quiet.request_subfeed(&lab(), &feed, &subfeed, 0).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn mismatched_topic_dropped() {
        let bus = InMemoryPubsub::new(16);
        let provider = hub(&bus, true, true);
        let node = Identity::generate();
        let (feed, subfeed) = ids();
        let body = PubsubMessageBody::SubfeedMessageCountUpdate {
            feed_id: feed,
            subfeed_hash: subfeed,
            message_count: 3,
        };
        let delivery = PubsubDelivery {
            topic: TopicKind::RequestFeeds.topic(&lab()),
            message: SignedPubsubMessage::sign(&node, body).unwrap(),
        };
        assert!(provider.accept(delivery).is_none());
    }

    #[test]
    fn unknown_channel_bucket_errors() {
        let bus = InMemoryPubsub::new(4);
        let h = hub(&bus, true, true);
        let other = ChannelName::parse("other").unwrap();
        assert!(matches!(h.bucket(&other), Err(FeedError::UnknownChannel { .. })));
        assert_eq!(h.channel_names(), vec![lab()]);
    }
}
