//! Feed manager: the node's exposed feed surface.
//!
//! Owns the shared subfeed state (log and uploaders), the per-scope subfeed
//! instances, the incoming/outgoing subscription registries and the pub/sub
//! dispatch loop.
//! All map access is short and never held across an await.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::feed::log::SubfeedLog;
use crate::feed::models::{
    ChannelName, ChannelScope, FeedId, SignedSubfeedMessage, SubfeedHash, SubfeedKey,
};
use crate::feed::store::FeedStore;
use crate::feed::subfeed::{SharedSubfeed, Subfeed};
use crate::hub::pubsub::{PubsubDelivery, PubsubMessageBody};
use crate::hub::{ChannelHub, HubMessage};
use crate::identity::Identity;
use crate::replication::subscriptions::{SubscriptionKey, SubscriptionRegistry};
use crate::replication::SyncTimings;

/// One subfeed to watch: entries from `position` onward, on `channel` (or
/// locally).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubfeedWatch {
    pub feed_id: FeedId,
    pub subfeed_hash: SubfeedHash,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub channel: Option<ChannelName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedInfo {
    pub feed_id: FeedId,
    pub exists: bool,
    pub is_writeable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub name: ChannelName,
    pub request_feeds: bool,
    pub provide_feeds: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub node_id: String,
    pub channels: Vec<ChannelStatus>,
    pub feed_count: usize,
    pub loaded_subfeeds: usize,
    pub incoming_subscriptions: usize,
    pub outgoing_subscriptions: usize,
}

pub struct FeedManager {
    store: FeedStore,
    hub: Arc<ChannelHub>,
    timings: SyncTimings,
    shared: DashMap<SubfeedKey, SharedSubfeed>,
    subfeeds: DashMap<(SubfeedKey, ChannelScope), Arc<Subfeed>>,
    incoming: SubscriptionRegistry<SubscriptionKey>,
    outgoing: SubscriptionRegistry<SubscriptionKey>,
}

impl FeedManager {
    pub fn new(store: FeedStore, hub: Arc<ChannelHub>, timings: SyncTimings) -> Self {
        Self {
            store,
            hub,
            timings,
            shared: DashMap::new(),
            subfeeds: DashMap::new(),
            incoming: SubscriptionRegistry::new(timings.renewal_period, timings.registry_grace),
            outgoing: SubscriptionRegistry::new(timings.renewal_period, timings.registry_grace),
        }
    }

    pub fn store(&self) -> &FeedStore {
        &self.store
    }

    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.hub
    }

    fn shared_for(&self, key: &SubfeedKey) -> Result<SharedSubfeed> {
        let entry = self.shared.entry(key.clone()).or_try_insert_with(|| {
            SubfeedLog::new(key.clone(), self.store.clone())
                .map(|log| SharedSubfeed::new(Arc::new(log)))
        })?;
        Ok(entry.value().clone())
    }

    /// The initialized subfeed instance for `key` in `scope`, created on
    /// first access.
    pub async fn subfeed(&self, key: &SubfeedKey, scope: &ChannelScope) -> Result<Arc<Subfeed>> {
        let map_key = (key.clone(), scope.clone());
        let existing = self.subfeeds.get(&map_key).map(|s| s.value().clone());
        let subfeed = match existing {
            Some(s) => s,
            None => {
                let fresh = Subfeed::new(
                    self.shared_for(key)?,
                    scope.clone(),
                    self.store.clone(),
                    self.hub.clone(),
                    self.timings,
                )?;
                self.subfeeds
                    .entry(map_key)
                    .or_insert_with(|| Arc::new(fresh))
                    .value()
                    .clone()
            }
        };
        subfeed.initialize().await?;
        Ok(subfeed)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(FeedStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store)).await?
    }

    /// Create a writeable feed with a fresh key, optionally under a name.
    pub async fn create_feed(&self, name: Option<String>) -> Result<FeedId> {
        let key = Identity::generate();
        let feed_id = FeedId::from_identity(&key);
        let id = feed_id.clone();
        let label = name.clone();
        self.blocking(move |store| {
            store.add_feed(&id)?;
            store.add_feed_key(&id, &key)?;
            if let Some(name) = &label {
                store.set_feed_name(name, &id)?;
            }
            Ok(())
        })
        .await?;
        tracing::info!(feed = %feed_id, name = ?name, "created feed");
        Ok(feed_id)
    }

    /// Delete a feed with its subfeeds, key and names. Returns whether it
    /// existed.
    pub async fn delete_feed(&self, feed_id: &FeedId) -> Result<bool> {
        let id = feed_id.clone();
        let existed = self.blocking(move |store| store.delete_feed(&id)).await?;
        self.subfeeds.retain(|(key, _), _| &key.feed_id != feed_id);
        self.shared.retain(|key, _| &key.feed_id != feed_id);
        if existed {
            tracing::info!(feed = %feed_id, "deleted feed");
        }
        Ok(existed)
    }

    pub async fn get_feed_id(&self, name: &str) -> Result<Option<FeedId>> {
        let name = name.to_string();
        self.blocking(move |store| store.get_feed_id_by_name(&name)).await
    }

    pub async fn has_writeable_feed(&self, feed_id: &FeedId) -> Result<bool> {
        let id = feed_id.clone();
        self.blocking(move |store| store.has_writeable_feed(&id)).await
    }

    pub async fn get_feed_info(&self, feed_id: &FeedId) -> Result<FeedInfo> {
        let id = feed_id.clone();
        let (exists, is_writeable) = self
            .blocking(move |store| Ok((store.has_feed(&id)?, store.has_writeable_feed(&id)?)))
            .await?;
        Ok(FeedInfo {
            feed_id: feed_id.clone(),
            exists,
            is_writeable,
        })
    }

    /// Sign and append to a local feed. Returns the new message count.
    pub async fn append_messages(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        payloads: Vec<serde_json::Value>,
        meta_data: Option<serde_json::Value>,
    ) -> Result<u64> {
        let key = SubfeedKey::new(feed_id.clone(), subfeed_hash.clone());
        self.subfeed(&key, &ChannelScope::Local)
            .await?
            .append_messages(payloads, meta_data)
            .await
    }

    pub async fn get_num_local_messages(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
    ) -> Result<u64> {
        let key = SubfeedKey::new(feed_id.clone(), subfeed_hash.clone());
        Ok(self
            .subfeed(&key, &ChannelScope::Local)
            .await?
            .get_num_local_messages())
    }

    pub async fn get_signed_messages(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        position: u64,
        max_count: usize,
    ) -> Result<Vec<SignedSubfeedMessage>> {
        let key = SubfeedKey::new(feed_id.clone(), subfeed_hash.clone());
        self.subfeed(&key, &ChannelScope::Local)
            .await?
            .get_signed_messages(position, max_count)
            .await
    }

    /// Wait for entries on any of `watches`. Returns as soon as one watch has
    /// data, together with whatever the others have at that moment; empty
    /// after `wait` with nothing new.
    pub async fn watch_for_new_messages(
        &self,
        watches: HashMap<String, SubfeedWatch>,
        wait: Duration,
        max_count: usize,
    ) -> Result<HashMap<String, Vec<SignedSubfeedMessage>>> {
        let mut watched = Vec::with_capacity(watches.len());
        for (name, watch) in watches {
            let key = SubfeedKey::new(watch.feed_id, watch.subfeed_hash);
            let scope = ChannelScope::from_option(watch.channel);
            if let ChannelScope::Remote(channel) = &scope {
                self.outgoing
                    .renew(SubscriptionKey::new(channel.clone(), key.clone()));
            }
            let subfeed = self.subfeed(&key, &scope).await?;
            subfeed.renew_outgoing().await;
            watched.push((name, subfeed, watch.position));
        }

        let available = collect_available(&watched, max_count);
        if !available.is_empty() || watched.is_empty() {
            return Ok(available);
        }

        let mut waits: FuturesUnordered<_> = watched
            .iter()
            .map(|(_, subfeed, position)| subfeed.wait_for_signed_messages(*position, max_count, wait))
            .collect();
        while let Some(result) = waits.next().await {
            if !result?.is_empty() {
                break;
            }
        }
        drop(waits);

        Ok(collect_available(&watched, max_count))
    }

    /// Route one pub/sub delivery.
    pub async fn handle_delivery(&self, delivery: PubsubDelivery) -> Result<()> {
        let Some(HubMessage {
            channel,
            from_node_id,
            body,
        }) = self.hub.accept(delivery)
        else {
            return Ok(());
        };

        match body {
            PubsubMessageBody::RequestSubfeed {
                feed_id,
                subfeed_hash,
                position,
            } => {
                if !self.has_feed(&feed_id).await? {
                    tracing::debug!(feed = %feed_id, from = %from_node_id, "request for unknown feed");
                    return Ok(());
                }
                let key = SubfeedKey::new(feed_id, subfeed_hash);
                if self
                    .incoming
                    .renew(SubscriptionKey::new(channel.clone(), key.clone()))
                {
                    tracing::info!(subfeed = %key, channel = %channel, from = %from_node_id, "new incoming subscription");
                }
                self.subfeed(&key, &ChannelScope::Remote(channel.clone()))
                    .await?
                    .handle_incoming_subscription(&channel, position)
                    .await
            }
            PubsubMessageBody::SubfeedMessageCountUpdate {
                feed_id,
                subfeed_hash,
                message_count,
            } => {
                let key = SubfeedKey::new(feed_id, subfeed_hash);
                if !self
                    .outgoing
                    .contains(&SubscriptionKey::new(channel.clone(), key.clone()))
                {
                    return Ok(());
                }
                self.subfeed(&key, &ChannelScope::Remote(channel))
                    .await?
                    .report_num_remote_messages(message_count)
                    .await?;
                Ok(())
            }
        }
    }

    async fn has_feed(&self, feed_id: &FeedId) -> Result<bool> {
        let id = feed_id.clone();
        self.blocking(move |store| store.has_feed(&id)).await
    }

    /// Evict lapsed subscriptions and expired uploaders.
    pub fn sweep(&self) {
        for entry in self.shared.iter() {
            entry.value().incoming.prune(entry.key());
        }
        for key in self.incoming.sweep() {
            tracing::debug!(subscription = %key, "incoming subscription lapsed");
        }
        for key in self.outgoing.sweep() {
            tracing::debug!(subscription = %key, "outgoing subscription lapsed");
        }
    }

    pub async fn status(&self) -> Result<ManagerStatus> {
        let feed_count = self.blocking(|store| store.list_feeds()).await?.len();
        let hub = &self.hub;
        let channels = hub
            .channel_names()
            .into_iter()
            .map(|name| ChannelStatus {
                request_feeds: hub.can_request(&name),
                provide_feeds: hub.can_provide(&name),
                name,
            })
            .collect();
        Ok(ManagerStatus {
            node_id: hub.node_id(),
            channels,
            feed_count,
            loaded_subfeeds: self.subfeeds.len(),
            incoming_subscriptions: self.incoming.len(),
            outgoing_subscriptions: self.outgoing.len(),
        })
    }

    /// Start the dispatch loop: one task per pub/sub delivery, plus the
    /// periodic registry sweep. Subscribes before returning, so nothing
    /// published afterwards is missed.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = self.hub.subscribe();
        tokio::spawn(self.clone().run(rx, cancel))
    }

    async fn run(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<PubsubDelivery>,
        cancel: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(self.timings.sweep_interval);
        tracing::info!(channels = self.hub.channel_names().len(), "feed manager started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => self.sweep(),
                received = rx.recv() => match received {
                    Ok(delivery) => {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            let topic = delivery.topic.clone();
                            if let Err(e) = manager.handle_delivery(delivery).await {
                                tracing::warn!(topic = %topic, error = %e, "failed to handle pubsub message");
                            }
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "pubsub receiver lagged, some messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("pubsub closed");
                        break;
                    }
                },
            }
        }
        tracing::info!("feed manager stopped");
    }
}

fn collect_available(
    watched: &[(String, Arc<Subfeed>, u64)],
    max_count: usize,
) -> HashMap<String, Vec<SignedSubfeedMessage>> {
    watched
        .iter()
        .filter_map(|(name, subfeed, position)| {
            let messages = subfeed.read(*position, max_count);
            (!messages.is_empty()).then(|| (name.clone(), messages))
        })
        .collect()
}
