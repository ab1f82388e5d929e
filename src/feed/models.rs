//! Feed data model: feeds, subfeeds, channels, and signed subfeed messages.
//!
//! A feed is identified by the hex of its Ed25519 public key. Each feed holds
//! subfeeds addressed by an opaque hex hash. A subfeed is an append-only log of
//! signed messages: message `n` carries the signature of message `n-1`
//! (`previousSignature`), forming a chain that any holder of the feed id can
//! verify. Positions start at 0 and have no gaps.
//!
//! Wire and bucket encoding uses the camelCase field names below; signatures
//! cover the canonical JSON of [`SubfeedMessageBody`] (see identity/signing.rs).

use std::fmt;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};
use crate::identity::keys::{verifying_key_from_hex, Identity};

fn is_lowercase(s: &str) -> bool {
    !s.bytes().any(|b| b.is_ascii_uppercase())
}

/// Feed id: lowercase hex of the feed's 32-byte public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedId(String);

impl FeedId {
    pub fn parse(s: &str) -> Result<Self> {
        let decodes_to_key = matches!(hex::decode(s), Ok(bytes) if bytes.len() == 32);
        if !decodes_to_key || !is_lowercase(s) {
            return Err(FeedError::InvalidId {
                reason: format!("feed id must be 64 lowercase hex chars: {s}"),
            });
        }
        Ok(Self(s.to_string()))
    }

    pub fn from_identity(identity: &Identity) -> Self {
        Self(identity.public_hex())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        verifying_key_from_hex(&self.0)
    }
}

impl TryFrom<String> for FeedId {
    type Error = FeedError;
    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<FeedId> for String {
    fn from(id: FeedId) -> Self {
        id.0
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subfeed hash: lowercase hex, at least 6 chars (the bucket path shards on
/// the first six).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubfeedHash(String);

impl SubfeedHash {
    pub fn parse(s: &str) -> Result<Self> {
        let valid = (6..=128).contains(&s.len())
            && is_lowercase(s)
            && s.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(FeedError::InvalidId {
                reason: format!("subfeed hash must be 6-128 lowercase hex chars: {s}"),
            });
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubfeedHash {
    type Error = FeedError;
    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<SubfeedHash> for String {
    fn from(h: SubfeedHash) -> Self {
        h.0
    }
}

impl fmt::Display for SubfeedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Channel name. Appears in bucket paths and pub/sub topic names, so the
/// character set is restricted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
    pub fn parse(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && s.len() <= 128
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
        if !valid {
            return Err(FeedError::InvalidId {
                reason: format!("invalid channel name: {s:?}"),
            });
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChannelName {
    type Error = FeedError;
    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ChannelName> for String {
    fn from(c: ChannelName) -> Self {
        c.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network scope a subfeed instance is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelScope {
    Local,
    Remote(ChannelName),
}

impl ChannelScope {
    pub fn from_option(channel: Option<ChannelName>) -> Self {
        channel.map_or(ChannelScope::Local, ChannelScope::Remote)
    }
}

impl fmt::Display for ChannelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelScope::Local => f.write_str("local"),
            ChannelScope::Remote(c) => write!(f, "remote:{c}"),
        }
    }
}

/// (feed, subfeed) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubfeedKey {
    pub feed_id: FeedId,
    pub subfeed_hash: SubfeedHash,
}

impl SubfeedKey {
    pub fn new(feed_id: FeedId, subfeed_hash: SubfeedHash) -> Self {
        Self {
            feed_id,
            subfeed_hash,
        }
    }
}

impl fmt::Display for SubfeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feed_id, self.subfeed_hash)
    }
}

/// The signed part of a subfeed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubfeedMessageBody {
    pub message: serde_json::Value,
    /// Signature of the message at `message_number - 1`; absent at 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_signature: Option<String>,
    pub message_number: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<serde_json::Value>,
}

/// One entry of a subfeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedSubfeedMessage {
    pub body: SubfeedMessageBody,
    /// Ed25519 signature of the canonical body (base64).
    pub signature: String,
}

impl SignedSubfeedMessage {
    pub fn position(&self) -> u64 {
        self.body.message_number
    }
}
