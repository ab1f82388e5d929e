//! Error types: identity, chain integrity, storage, bucket, and pub/sub.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("identity not found at {path}")]
    IdentityNotFound { path: String },

    #[error("invalid keypair: {reason}")]
    InvalidKeypair { reason: String },

    #[error("invalid identifier: {reason}")]
    InvalidId { reason: String },

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("feed integrity violation: {reason}")]
    FeedIntegrity { reason: String },

    #[error("position gap: expected {expected}, found {found}")]
    PositionGap { expected: u64, found: u64 },

    #[error("feed is not writeable on this node: {feed_id}")]
    NotWriteable { feed_id: String },

    #[error("feed not found: {feed_id}")]
    FeedNotFound { feed_id: String },

    #[error("subfeed initialization failed: {reason}")]
    Initialization { reason: String },

    #[error("bucket store inconsistency: {reason}")]
    StoreInconsistency { reason: String },

    #[error("not a member of channel: {channel}")]
    UnknownChannel { channel: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {reason}")]
    Config { reason: String },
}

impl FeedError {
    /// Integrity failures are never retried and never repaired.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            FeedError::SignatureInvalid
                | FeedError::FeedIntegrity { .. }
                | FeedError::PositionGap { .. }
                | FeedError::StoreInconsistency { .. }
        )
    }
}

impl From<tokio::task::JoinError> for FeedError {
    fn from(e: tokio::task::JoinError) -> Self {
        FeedError::Io(std::io::Error::other(format!("blocking task failed: {e}")))
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
