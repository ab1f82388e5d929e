//! Subscription registries.
//!
//! A subscription lives as long as it keeps being renewed. Renewals arrive
//! every half renewal period, so one missed renewal is tolerated; a key is
//! evicted once its last renewal is older than the full period.
//!
//! Expiry deadlines sit in a min-heap next to the map. A renewal pushes a
//! fresh deadline and leaves the old one in place; popping a stale deadline
//! finds a newer renewal in the map and keeps the key.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::feed::models::{ChannelName, SubfeedKey};

/// Registry key for both directions: which channel, which subfeed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub channel: ChannelName,
    pub subfeed: SubfeedKey,
}

impl SubscriptionKey {
    pub fn new(channel: ChannelName, subfeed: SubfeedKey) -> Self {
        Self { channel, subfeed }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.subfeed)
    }
}

struct Inner<K> {
    renewed_at: HashMap<K, Instant>,
    deadlines: BinaryHeap<Reverse<(Instant, K)>>,
}

pub struct SubscriptionRegistry<K> {
    period: Duration,
    grace: Duration,
    inner: Mutex<Inner<K>>,
}

impl<K> SubscriptionRegistry<K>
where
    K: Clone + Eq + Hash + Ord,
{
    pub fn new(period: Duration, grace: Duration) -> Self {
        Self {
            period,
            grace,
            inner: Mutex::new(Inner {
                renewed_at: HashMap::new(),
                deadlines: BinaryHeap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a renewal. Returns true if the key was not registered.
    pub fn renew(&self, key: K) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        Self::sweep_locked(&mut inner, now, self.period);
        inner
            .deadlines
            .push(Reverse((now + self.period + self.grace, key.clone())));
        inner.renewed_at.insert(key, now).is_none()
    }

    /// Evict lapsed keys. Returns the evicted keys.
    pub fn sweep(&self) -> Vec<K> {
        let mut inner = self.lock();
        Self::sweep_locked(&mut inner, Instant::now(), self.period)
    }

    fn sweep_locked(inner: &mut Inner<K>, now: Instant, period: Duration) -> Vec<K> {
        let mut evicted = Vec::new();
        while let Some(Reverse((deadline, _))) = inner.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, key))) = inner.deadlines.pop() else {
                break;
            };
            let lapsed = inner
                .renewed_at
                .get(&key)
                .is_some_and(|renewed| now.duration_since(*renewed) > period);
            if lapsed {
                inner.renewed_at.remove(&key);
                evicted.push(key);
            }
        }
        evicted
    }

    pub fn contains(&self, key: &K) -> bool {
        let mut inner = self.lock();
        Self::sweep_locked(&mut inner, Instant::now(), self.period);
        inner.renewed_at.contains_key(key)
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<K> {
        let mut inner = self.lock();
        Self::sweep_locked(&mut inner, Instant::now(), self.period);
        let mut keys: Vec<K> = inner.renewed_at.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        let mut inner = self.lock();
        Self::sweep_locked(&mut inner, Instant::now(), self.period);
        inner.renewed_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
