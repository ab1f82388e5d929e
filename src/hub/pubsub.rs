//! Pub/sub signaling: signed envelopes, topic names, and transports.
//!
//! Two topics per channel:
//! - `<channel>-requestFeeds`: `requestSubfeed` from nodes that want a subfeed
//! - `<channel>-provideFeeds`: `subfeedMessageCountUpdate` from nodes that
//!   uploaded one
//!
//! Delivery is at-least-once and unordered. Every envelope carries the
//! sender's node id and a signature over the body; receivers verify it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::feed::models::{ChannelName, FeedId, SubfeedHash};
use crate::identity::{sign_body, verify_body, verifying_key_from_hex, Identity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PubsubMessageBody {
    #[serde(rename_all = "camelCase")]
    RequestSubfeed {
        feed_id: FeedId,
        subfeed_hash: SubfeedHash,
        position: u64,
    },
    #[serde(rename_all = "camelCase")]
    SubfeedMessageCountUpdate {
        feed_id: FeedId,
        subfeed_hash: SubfeedHash,
        message_count: u64,
    },
}

impl PubsubMessageBody {
    /// The topic kind this body must arrive on.
    pub fn topic_kind(&self) -> TopicKind {
        match self {
            PubsubMessageBody::RequestSubfeed { .. } => TopicKind::RequestFeeds,
            PubsubMessageBody::SubfeedMessageCountUpdate { .. } => TopicKind::ProvideFeeds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPubsubMessage {
    pub body: PubsubMessageBody,
    pub from_node_id: String,
    pub signature: String,
}

impl SignedPubsubMessage {
    pub fn sign(node: &Identity, body: PubsubMessageBody) -> Result<Self> {
        let signature = sign_body(node, &body)?;
        Ok(Self {
            body,
            from_node_id: node.public_hex(),
            signature,
        })
    }

    pub fn verify(&self) -> Result<()> {
        let key = verifying_key_from_hex(&self.from_node_id)?;
        verify_body(&key, &self.body, &self.signature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    RequestFeeds,
    ProvideFeeds,
}

impl TopicKind {
    pub fn topic(self, channel: &ChannelName) -> String {
        match self {
            TopicKind::RequestFeeds => format!("{channel}-requestFeeds"),
            TopicKind::ProvideFeeds => format!("{channel}-provideFeeds"),
        }
    }
}

/// A message as received from the transport.
#[derive(Debug, Clone)]
pub struct PubsubDelivery {
    pub topic: String,
    pub message: SignedPubsubMessage,
}

/// Pub/sub transport. Implementations need not order or deduplicate.
#[async_trait]
pub trait PubsubTransport: Send + Sync {
    async fn publish(&self, topic: &str, message: SignedPubsubMessage) -> Result<()>;

    /// Receiver of every delivery on the transport. Callers filter by topic.
    fn subscribe(&self) -> broadcast::Receiver<PubsubDelivery>;
}

/// In-process transport. Clones share one bus, so several nodes in one
/// process (tests, local demos) can signal each other.
#[derive(Clone, Debug)]
pub struct InMemoryPubsub {
    tx: broadcast::Sender<PubsubDelivery>,
}

impl InMemoryPubsub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for InMemoryPubsub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubsubTransport for InMemoryPubsub {
    async fn publish(&self, topic: &str, message: SignedPubsubMessage) -> Result<()> {
        let delivery = PubsubDelivery {
            topic: topic.to_string(),
            message,
        };
        // No subscribers is not an error: nobody is listening yet.
        let _ = self.tx.send(delivery);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PubsubDelivery> {
        self.tx.subscribe()
    }
}
