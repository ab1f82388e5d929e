//! Ed25519 sign/verify over canonical JSON, used by subfeed entries and
//! pub/sub envelopes.
//!
//! Canonical form: the body is converted to a `serde_json::Value`, object
//! keys are sorted at every depth, and the compact serialization of that
//! value is the signed byte string.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{FeedError, Result};
use crate::identity::keys::Identity;

/// Deterministic bytes for a serializable body.
pub fn canonical_json<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    let value = sort_keys(serde_json::to_value(body)?);
    Ok(serde_json::to_vec(&value)?)
}

// Output must not depend on serde_json's `preserve_order` feature.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Sign arbitrary bytes with a key.
pub fn sign_bytes(identity: &Identity, data: &[u8]) -> Signature {
    identity.signing_key.sign(data)
}

/// Verify a signature against a public key and data.
pub fn verify_signature(
    verifying_key: &VerifyingKey,
    data: &[u8],
    signature: &Signature,
) -> Result<()> {
    verifying_key
        .verify(data, signature)
        .map_err(|_| FeedError::SignatureInvalid)
}

/// Sign the canonical form of `body`, returning a base64 signature.
pub fn sign_body<T: Serialize>(identity: &Identity, body: &T) -> Result<String> {
    let bytes = canonical_json(body)?;
    Ok(B64.encode(sign_bytes(identity, &bytes).to_bytes()))
}

/// Verify a base64 signature over the canonical form of `body`.
pub fn verify_body<T: Serialize>(
    verifying_key: &VerifyingKey,
    body: &T,
    signature_b64: &str,
) -> Result<()> {
    let sig_bytes = B64
        .decode(signature_b64)
        .map_err(|_| FeedError::SignatureInvalid)?;
    let sig_array: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| FeedError::SignatureInvalid)?;
    let signature = Signature::from_bytes(&sig_array);
    let bytes = canonical_json(body)?;
    verify_signature(verifying_key, &bytes, &signature)
}
