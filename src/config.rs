use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::feed::models::ChannelName;
use crate::replication::SyncTimings;

/// Bucket backend for one channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BucketConfig {
    /// In-process memory (tests and single-node experiments).
    #[default]
    Memory,
    /// Local directory, e.g. a shared mount.
    Local { path: PathBuf },
    /// S3-compatible bucket. Missing credentials fall back to the
    /// standard AWS environment variables.
    S3 {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key: Option<String>,
        #[serde(default)]
        secret_key: Option<String>,
    },
}

/// Membership in one replication channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub bucket: BucketConfig,
    /// Send subfeed requests on this channel and download from its bucket.
    #[serde(default = "default_true")]
    pub request_feeds: bool,
    /// Answer subfeed requests on this channel by uploading to its bucket.
    #[serde(default = "default_true")]
    pub provide_feeds: bool,
}

/// Replication timings, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Subscription renewal period. Requests are re-sent every half period.
    #[serde(default = "default_renewal_period_secs")]
    pub renewal_period_secs: u64,
    /// How often an incoming connection rechecks for pending uploads.
    #[serde(default = "default_incoming_recheck_secs")]
    pub incoming_recheck_secs: u64,
    /// Silence from a requester after which its connection may expire.
    #[serde(default = "default_incoming_expiry_secs")]
    pub incoming_expiry_secs: u64,
    #[serde(default = "default_response_grace_secs")]
    pub response_grace_secs: u64,
    /// Extra time past the renewal period before a registry entry is swept.
    #[serde(default = "default_registry_grace_secs")]
    pub registry_grace_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_renewal_period_secs() -> u64 {
    60
}

fn default_incoming_recheck_secs() -> u64 {
    5
}

fn default_incoming_expiry_secs() -> u64 {
    60
}

fn default_response_grace_secs() -> u64 {
    10
}

fn default_registry_grace_secs() -> u64 {
    5
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_node_label() -> String {
    "feedmesh-node".to_string()
}

fn default_pubsub_capacity() -> usize {
    1024
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            renewal_period_secs: default_renewal_period_secs(),
            incoming_recheck_secs: default_incoming_recheck_secs(),
            incoming_expiry_secs: default_incoming_expiry_secs(),
            response_grace_secs: default_response_grace_secs(),
            registry_grace_secs: default_registry_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SyncSettings {
    pub fn timings(&self) -> SyncTimings {
        SyncTimings {
            renewal_period: Duration::from_secs(self.renewal_period_secs),
            incoming_recheck: Duration::from_secs(self.incoming_recheck_secs),
            incoming_expiry: Duration::from_secs(self.incoming_expiry_secs),
            response_grace: Duration::from_secs(self.response_grace_secs),
            registry_grace: Duration::from_secs(self.registry_grace_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub port: u16,
    /// Human-readable name reported in status.
    #[serde(default = "default_node_label")]
    pub node_label: String,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub sync: SyncSettings,
    /// Buffer size of the in-process pub/sub bus.
    #[serde(default = "default_pubsub_capacity")]
    pub pubsub_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            port: 7660,
            node_label: default_node_label(),
            channels: Vec::new(),
            sync: SyncSettings::default(),
            pubsub_capacity: default_pubsub_capacity(),
        }
    }
}

impl Config {
    pub fn identity_dir(&self) -> PathBuf {
        self.data_dir.join("identity")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("feedmesh.db")
    }

    /// Returns the default config file path for a given data directory.
    pub fn config_file_path(data_dir: &Path) -> PathBuf {
        data_dir.join("config.yaml")
    }

    /// Load config from a YAML file. Returns None if the file does not exist.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Option<Config>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(Some(config))
    }

    /// Write a default config file with documentation comments.
    /// Returns an error if the file already exists (to prevent accidental overwrite).
    pub fn write_default_config(path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            anyhow::bail!(
                "config file already exists: {}. Remove it first to regenerate.",
                path.display()
            );
        }
        let template = include_str!("config_template.yaml");
        std::fs::write(path, template)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the config for obvious errors.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for channel in &self.channels {
            ChannelName::parse(&channel.name)
                .with_context(|| format!("bad channel name: {:?}", channel.name))?;
            if !seen.insert(channel.name.as_str()) {
                anyhow::bail!("duplicate channel: {}", channel.name);
            }
            if let BucketConfig::S3 { bucket, .. } = &channel.bucket {
                if bucket.is_empty() {
                    anyhow::bail!("channel {} has an empty S3 bucket name", channel.name);
                }
            }
        }

        let s = &self.sync;
        if s.renewal_period_secs < 2 {
            anyhow::bail!("sync.renewal_period_secs must be at least 2");
        }
        if s.incoming_recheck_secs == 0 || s.sweep_interval_secs == 0 {
            anyhow::bail!("sync.incoming_recheck_secs and sync.sweep_interval_secs must be positive");
        }
        if s.incoming_expiry_secs <= s.response_grace_secs {
            anyhow::bail!(
                "sync.incoming_expiry_secs ({}) must exceed sync.response_grace_secs ({})",
                s.incoming_expiry_secs,
                s.response_grace_secs
            );
        }
        if self.node_label.trim().is_empty() {
            anyhow::bail!("node_label must not be empty");
        }
        if self.pubsub_capacity == 0 {
            anyhow::bail!("pubsub_capacity must be positive");
        }
        Ok(())
    }
}
