//! Pull-side heartbeat for a subfeed watched on a remote channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::Result;
use crate::feed::models::{ChannelName, SubfeedKey};
use crate::hub::ChannelHub;

/// Sends `requestSubfeed` for one (subfeed, channel), at most once per
/// request interval.
pub struct OutgoingSubfeedConnection {
    key: SubfeedKey,
    channel: ChannelName,
    hub: Arc<ChannelHub>,
    interval: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl OutgoingSubfeedConnection {
    pub fn new(
        key: SubfeedKey,
        channel: ChannelName,
        hub: Arc<ChannelHub>,
        interval: Duration,
    ) -> Self {
        Self {
            key,
            channel,
            hub,
            interval,
            last_sent: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Send a request reporting `position` local messages, unless one went
    /// out within the last interval. Returns whether a request was sent.
    pub async fn renew(&self, position: u64) -> Result<bool> {
        if !self.hub.can_request(&self.channel) {
            return Ok(false);
        }

        let previous = {
            let mut last = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if last.is_some_and(|t| now.duration_since(t) < self.interval) {
                return Ok(false);
            }
            last.replace(now)
        };

        let sent = self
            .hub
            .request_subfeed(
                &self.channel,
                &self.key.feed_id,
                &self.key.subfeed_hash,
                position,
            )
            .await;
        if let Err(e) = sent {
            *self.last_sent.lock().unwrap_or_else(|e| e.into_inner()) = previous;
            return Err(e);
        }

        tracing::debug!(
            subfeed = %self.key,
            channel = %self.channel,
            position,
            "requested subfeed"
        );
        Ok(true)
    }
}
