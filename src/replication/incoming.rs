//! Push side: one uploader per (subfeed, requesting channel).
//!
//! The uploader task wakes on an incoming request, on a change of the local
//! message count, or every recheck interval. When the lowest position any
//! requester reported is behind the local count it publishes the delta to
//! the channel bucket and announces the new count. The task ends when the
//! connection expires or is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::feed::log::SubfeedLog;
use crate::feed::models::{ChannelName, SubfeedKey};
use crate::hub::bucket::SubfeedBucket;
use crate::hub::ChannelHub;
use crate::replication::SyncTimings;

/// Publish local entries the bucket does not have yet. Returns the local
/// message count, which the bucket now covers.
pub async fn upload_subfeed(log: &SubfeedLog, bucket: &SubfeedBucket) -> Result<u64> {
    let key = log.key();
    let uploaded = bucket
        .load_watermark(&key.feed_id, &key.subfeed_hash)
        .await?
        .unwrap_or(0);
    let local = log.count();
    if uploaded < local {
        let pending = usize::try_from(local - uploaded).unwrap_or(usize::MAX);
        let messages = log.read(uploaded, pending);
        bucket
            .upload(&key.feed_id, &key.subfeed_hash, &messages)
            .await?;
    }
    Ok(local)
}

#[derive(Debug, Clone, Copy)]
struct ConnectionState {
    lowest_received_position: Option<u64>,
    /// Requests handled so far.
    requests: u64,
    last_request_at: Instant,
    last_sent_at: Option<Instant>,
}

fn is_expired(state: &ConnectionState, now: Instant, timings: &SyncTimings) -> bool {
    let since_request = now.duration_since(state.last_request_at);
    if since_request <= timings.incoming_expiry {
        return false;
    }
    match state.last_sent_at {
        None => true,
        Some(sent) => {
            // We announced after the last request and nobody renewed.
            let since_sent = now.duration_since(sent);
            since_sent > timings.response_grace
                && since_sent + timings.response_grace < since_request
        }
    }
}

struct Shared {
    log: Arc<SubfeedLog>,
    bucket: SubfeedBucket,
    hub: Arc<ChannelHub>,
    timings: SyncTimings,
    state: Mutex<ConnectionState>,
    wake: Notify,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expired(&self) -> bool {
        is_expired(&self.state(), Instant::now(), &self.timings)
    }

    async fn check_upload(&self) -> Result<()> {
        let before = self.state();
        let Some(lowest) = before.lowest_received_position else {
            return Ok(());
        };
        if lowest >= self.log.count() {
            return Ok(());
        }

        let uploaded = upload_subfeed(&self.log, &self.bucket).await?;
        let key = self.log.key();
        self.hub
            .announce_message_count(
                self.bucket.channel(),
                &key.feed_id,
                &key.subfeed_hash,
                uploaded,
            )
            .await?;

        self.record_upload(before.requests, uploaded);
        tracing::debug!(
            subfeed = %key,
            channel = %self.bucket.channel(),
            count = uploaded,
            "announced uploaded subfeed"
        );
        Ok(())
    }

    /// The bucket now covers `uploaded`. A request that arrived since
    /// `requests_before` keeps its lower position so the next wake answers it.
    fn record_upload(&self, requests_before: u64, uploaded: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.lowest_received_position = if state.requests == requests_before {
            Some(uploaded)
        } else {
            state
                .lowest_received_position
                .map(|lowest| lowest.min(uploaded))
        };
        state.last_sent_at = Some(Instant::now());
    }
}

pub struct IncomingSubfeedConnection {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl IncomingSubfeedConnection {
    /// Start the uploader for `bucket`'s channel. Must be called inside a
    /// tokio runtime.
    pub fn spawn(
        log: Arc<SubfeedLog>,
        bucket: SubfeedBucket,
        hub: Arc<ChannelHub>,
        timings: SyncTimings,
    ) -> Self {
        let shared = Arc::new(Shared {
            log,
            bucket,
            hub,
            timings,
            state: Mutex::new(ConnectionState {
                lowest_received_position: None,
                requests: 0,
                last_request_at: Instant::now(),
                last_sent_at: None,
            }),
            wake: Notify::new(),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(shared.clone(), cancel.clone()));
        Self {
            shared,
            cancel,
            task,
        }
    }

    pub fn channel(&self) -> &ChannelName {
        self.shared.bucket.channel()
    }

    /// A requester on this channel holds `position` messages.
    pub fn handle_request(&self, position: u64) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.lowest_received_position = Some(
                state
                    .lowest_received_position
                    .map_or(position, |lowest| lowest.min(position)),
            );
            state.requests += 1;
            state.last_request_at = Instant::now();
        }
        self.shared.wake.notify_one();
    }

    pub fn is_expired(&self) -> bool {
        self.shared.expired()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for IncomingSubfeedConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Incoming connections of one subfeed, one per requesting channel. Every
/// scope instance of the subfeed shares the same set.
#[derive(Default)]
pub struct IncomingConnections {
    by_channel: Mutex<HashMap<ChannelName, IncomingSubfeedConnection>>,
}

impl IncomingConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a request to `channel`'s connection, starting one with `spawn`
    /// if there is none (or the previous one expired).
    pub fn handle_request<F>(&self, key: &SubfeedKey, channel: &ChannelName, position: u64, spawn: F)
    where
        F: FnOnce() -> IncomingSubfeedConnection,
    {
        self.prune(key);
        let mut by_channel = self.by_channel.lock().unwrap_or_else(|e| e.into_inner());
        let connection = by_channel.entry(channel.clone()).or_insert_with(|| {
            tracing::info!(subfeed = %key, channel = %channel, "new incoming subfeed connection");
            spawn()
        });
        connection.handle_request(position);
    }

    /// Drop expired or stopped connections. Returns how many were dropped.
    pub fn prune(&self, key: &SubfeedKey) -> usize {
        let mut by_channel = self.by_channel.lock().unwrap_or_else(|e| e.into_inner());
        let before = by_channel.len();
        by_channel.retain(|channel, connection| {
            let keep = !connection.is_expired() && connection.is_running();
            if !keep {
                tracing::debug!(subfeed = %key, channel = %channel, "dropping expired incoming connection");
            }
            keep
        });
        before - by_channel.len()
    }

    /// Number of connections, expired ones included until the next prune.
    pub fn len(&self) -> usize {
        self.by_channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut counts = shared.log.subscribe();
    let key = shared.log.key().clone();
    let channel = shared.bucket.channel().clone();
    tracing::debug!(subfeed = %key, channel = %channel, "incoming subfeed connection started");

    loop {
        if shared.expired() {
            tracing::debug!(subfeed = %key, channel = %channel, "incoming subfeed connection expired");
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.timings.incoming_recheck) => {}
            _ = shared.wake.notified() => {}
            changed = counts.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if shared.expired() {
            continue;
        }
        if let Err(e) = shared.check_upload().await {
            tracing::warn!(
                subfeed = %key,
                channel = %channel,
                error = %e,
                "subfeed upload failed, retrying on next wake"
            );
        }
    }
}
