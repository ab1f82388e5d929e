//! Ed25519 keys for the node and for each writable feed.
//!
//! The node identity signs pub/sub envelopes. Each feed has its own keypair;
//! the feed id is the lowercase hex of the 32-byte public key, so any node
//! can derive the verifying key from the id alone.
//! Key storage: raw 32-byte file (`secret.key`) for the node; feed keys live
//! in the SQLite store as hex.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::path::Path;

use crate::error::{FeedError, Result};

/// Full identity with private key (local only).
pub struct Identity {
    pub signing_key: SigningKey,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Lowercase hex of the public key. Used as node id and feed id.
    pub fn public_hex(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    /// Hex of the secret key bytes, for the feed key table.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Parse a hex-encoded secret key.
    pub fn from_secret_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| FeedError::InvalidKeypair {
            reason: format!("secret key is not valid hex: {e}"),
        })?;
        let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| FeedError::InvalidKeypair {
            reason: "expected 32 bytes".into(),
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    /// Save private key bytes to file (unencrypted).
    pub fn save_unencrypted(&self, path: &Path) -> Result<()> {
        let dir = path.parent().ok_or_else(|| FeedError::Config {
            reason: "invalid key path".into(),
        })?;
        std::fs::create_dir_all(dir)?;
        std::fs::write(path, self.signing_key.to_bytes())?;
        restrict_to_owner(path);
        Ok(())
    }

    /// Load private key from unencrypted file.
    pub fn load_unencrypted(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|_| FeedError::IdentityNotFound {
            path: path.display().to_string(),
        })?;
        let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| FeedError::InvalidKeypair {
            reason: "expected 32 bytes".into(),
        })?;
        let signing_key = SigningKey::from_bytes(&key_bytes);
        Ok(Self { signing_key })
    }

    /// Load or generate identity at the given directory.
    pub fn load_or_generate(identity_dir: &Path) -> Result<Self> {
        let key_path = identity_dir.join("secret.key");
        if key_path.exists() {
            Self::load_unencrypted(&key_path)
        } else {
            let identity = Self::generate();
            identity.save_unencrypted(&key_path)?;
            // Also save public key for convenience
            let pub_path = identity_dir.join("public.key");
            std::fs::write(pub_path, identity.public_hex().as_bytes())?;
            Ok(identity)
        }
    }
}

/// Parse a hex public key (feed id or node id) into a verifying key.
pub fn verifying_key_from_hex(s: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(s).map_err(|e| FeedError::InvalidKeypair {
        reason: format!("public key is not valid hex ({e}): {s}"),
    })?;
    let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| FeedError::InvalidKeypair {
        reason: "expected 32 bytes after decode".into(),
    })?;
    VerifyingKey::from_bytes(&key_bytes).map_err(|e| FeedError::InvalidKeypair {
        reason: format!("invalid ed25519 public key: {e}"),
    })
}

/// Mode 0600 on the secret key file. Failure is logged, not fatal.
#[cfg(unix)]
fn restrict_to_owner(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!(path = %path.display(), error = %e, "failed to restrict key file permissions");
    }
}

#[cfg(not(unix))]
fn restrict_to_owner(path: &Path) {
    tracing::debug!(path = %path.display(), "key file permissions left to the platform default");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_hex_roundtrips_to_verifying_key() {
        let identity = Identity::generate();
        let id = identity.public_hex();

        assert_eq!(id.len(), 64);
        assert_eq!(id, id.to_lowercase());

        let vk = verifying_key_from_hex(&id).unwrap();
        assert_eq!(vk, identity.verifying_key());
    }

    #[test]
    fn secret_hex_roundtrip() {
        let identity = Identity::generate();
        let restored = Identity::from_secret_hex(&identity.secret_hex()).unwrap();
        assert_eq!(identity.verifying_key(), restored.verifying_key());
    }

    #[test]
    fn save_and_load_unencrypted() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("secret.key");

        let identity = Identity::generate();
        identity.save_unencrypted(&key_path).unwrap();

        let loaded = Identity::load_unencrypted(&key_path).unwrap();
        assert_eq!(identity.verifying_key(), loaded.verifying_key());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn load_or_generate_creates_new() {
        let dir = tempfile::tempdir().unwrap();
        let identity_dir = dir.path().join("identity");

        let id1 = Identity::load_or_generate(&identity_dir).unwrap();
        let id2 = Identity::load_or_generate(&identity_dir).unwrap();

        // Same key loaded both times
        assert_eq!(id1.verifying_key(), id2.verifying_key());
    }

    #[test]
    fn invalid_public_hex() {
        assert!(verifying_key_from_hex("not-hex").is_err());
        assert!(verifying_key_from_hex("abcd").is_err());
    }

    #[test]
    fn bad_secret_hex_rejected() {
        assert!(Identity::from_secret_hex("abc").is_err());
        assert!(Identity::from_secret_hex("zz").is_err());
        assert!(Identity::from_secret_hex("0aff").is_err());
    }
}
