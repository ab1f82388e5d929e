//! Subfeed replication between nodes.
//!
//! Pull side: a node watching a remote subfeed periodically sends
//! `requestSubfeed` ([`outgoing`]) and downloads from the channel bucket
//! when a count update arrives ([`downloader`]).
//!
//! Push side: a node holding the subfeed keeps one uploader per requesting
//! channel ([`incoming`]) that publishes new entries to the bucket and
//! announces the new count.

pub mod downloader;
pub mod incoming;
pub mod outgoing;
pub mod subscriptions;

use std::time::Duration;

pub use downloader::RemoteSubfeedMessageDownloader;
pub use incoming::IncomingSubfeedConnection;
pub use outgoing::OutgoingSubfeedConnection;
pub use subscriptions::SubscriptionRegistry;

/// Replication timings. Built from `config::SyncSettings`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimings {
    /// Subscriptions renew every half period and lapse after one full period.
    pub renewal_period: Duration,
    pub incoming_recheck: Duration,
    pub incoming_expiry: Duration,
    pub response_grace: Duration,
    pub registry_grace: Duration,
    pub sweep_interval: Duration,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            renewal_period: Duration::from_secs(60),
            incoming_recheck: Duration::from_secs(5),
            incoming_expiry: Duration::from_secs(60),
            response_grace: Duration::from_secs(10),
            registry_grace: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl SyncTimings {
    /// Interval between outgoing requests for a watched subfeed.
    pub fn request_interval(&self) -> Duration {
        self.renewal_period / 2
    }

    /// Millisecond-scale timings for tests driving several nodes in one
    /// process.
    pub fn fast() -> Self {
        Self {
            renewal_period: Duration::from_millis(400),
            incoming_recheck: Duration::from_millis(50),
            incoming_expiry: Duration::from_millis(400),
            response_grace: Duration::from_millis(100),
            registry_grace: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(200),
        }
    }
}
