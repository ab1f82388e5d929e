//! Chain construction and verification. No I/O.
//!
//! Every accepted entry satisfies, relative to the tail it extends:
//! - `message_number` equals the tail's message count
//! - `previous_signature` equals the tail's last signature (absent at 0)
//! - `signature` verifies against the feed key over the canonical body

use ed25519_dalek::VerifyingKey;

use crate::error::{FeedError, Result};
use crate::feed::models::{SignedSubfeedMessage, SubfeedMessageBody};
use crate::identity::{sign_body, verify_body, Identity};

/// The end of a subfeed that the next entry must link to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainTail {
    pub count: u64,
    pub last_signature: Option<String>,
}

impl ChainTail {
    pub fn of(entries: &[SignedSubfeedMessage]) -> Self {
        Self {
            count: entries.len() as u64,
            last_signature: entries.last().map(|m| m.signature.clone()),
        }
    }

    fn advance(&mut self, entry: &SignedSubfeedMessage) {
        self.count += 1;
        self.last_signature = Some(entry.signature.clone());
    }
}

/// Sign `payloads` as the next entries after `tail`.
pub fn sign_messages(
    key: &Identity,
    tail: &ChainTail,
    payloads: Vec<serde_json::Value>,
    meta_data: Option<serde_json::Value>,
    timestamp: i64,
) -> Result<Vec<SignedSubfeedMessage>> {
    let mut tail = tail.clone();
    let mut out = Vec::with_capacity(payloads.len());
    for message in payloads {
        let body = SubfeedMessageBody {
            message,
            previous_signature: tail.last_signature.clone(),
            message_number: tail.count,
            timestamp,
            meta_data: meta_data.clone(),
        };
        let signature = sign_body(key, &body)?;
        let signed = SignedSubfeedMessage { body, signature };
        tail.advance(&signed);
        out.push(signed);
    }
    Ok(out)
}

/// Verify the signature of one entry, ignoring its position in a chain.
pub fn verify_message(key: &VerifyingKey, entry: &SignedSubfeedMessage) -> Result<()> {
    verify_body(key, &entry.body, &entry.signature)
}

/// Verify that `entries` extend `tail` without gaps and with valid links and
/// signatures. Fails on the first bad entry; callers reject the whole batch.
pub fn verify_chain(
    key: &VerifyingKey,
    tail: &ChainTail,
    entries: &[SignedSubfeedMessage],
) -> Result<ChainTail> {
    let mut tail = tail.clone();
    for entry in entries {
        if entry.body.message_number != tail.count {
            return Err(FeedError::PositionGap {
                expected: tail.count,
                found: entry.body.message_number,
            });
        }
        if entry.body.previous_signature != tail.last_signature {
            return Err(FeedError::FeedIntegrity {
                reason: format!(
                    "previous signature mismatch at position {}",
                    entry.body.message_number
                ),
            });
        }
        verify_message(key, entry).map_err(|_| FeedError::FeedIntegrity {
            reason: format!("bad signature at position {}", entry.body.message_number),
        })?;
        tail.advance(entry);
    }
    Ok(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain(key: &Identity, n: usize) -> Vec<SignedSubfeedMessage> {
        let payloads = (0..n).map(|i| json!({ "i": i })).collect();
        sign_messages(key, &ChainTail::default(), payloads, None, 1_700_000_000_000).unwrap()
    }

    #[test]
    fn signed_chain_links_previous_signatures() {
        let key = Identity::generate();
        let entries = chain(&key, 4);

        assert!(entries[0].body.previous_signature.is_none());
        for i in 1..entries.len() {
            assert_eq!(
                entries[i].body.previous_signature.as_deref(),
                Some(entries[i - 1].signature.as_str())
            );
            assert_eq!(entries[i].position(), i as u64);
        }
        let tail = verify_chain(&key.verifying_key(), &ChainTail::default(), &entries).unwrap();
        assert_eq!(tail, ChainTail::of(&entries));
    }

    #[test]
    fn extends_existing_tail() {
        let key = Identity::generate();
        let first = chain(&key, 2);
        let tail = ChainTail::of(&first);
        let more = sign_messages(&key, &tail, vec![json!("c")], None, 5).unwrap();

        assert_eq!(more[0].position(), 2);
        verify_chain(&key.verifying_key(), &tail, &more).unwrap();
        // Not valid from the empty tail
        assert!(verify_chain(&key.verifying_key(), &ChainTail::default(), &more).is_err());
    }

    #[test]
    fn forged_signature_rejected() {
        let key = Identity::generate();
        let mut entries = chain(&key, 3);
        let other = Identity::generate();
        entries[2].signature = sign_body(&other, &entries[2].body).unwrap();

        let err = verify_chain(&key.verifying_key(), &ChainTail::default(), &entries).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn tampered_payload_rejected() {
        let key = Identity::generate();
        let mut entries = chain(&key, 2);
        entries[1].body.message = json!("changed");
        assert!(verify_chain(&key.verifying_key(), &ChainTail::default(), &entries).is_err());
    }

    #[test]
    fn gap_rejected() {
        let key = Identity::generate();
        let entries = chain(&key, 3);
        let err = verify_chain(&key.verifying_key(), &ChainTail::default(), &entries[1..])
            .unwrap_err();
        assert!(matches!(err, FeedError::PositionGap { expected: 0, found: 1 }));
    }

    #[test]
    fn meta_data_is_signed() {
        let key = Identity::generate();
        let mut entries = sign_messages(
            &key,
            &ChainTail::default(),
            vec![json!(1)],
            Some(json!({"source": "test"})),
            7,
        )
        .unwrap();
        verify_message(&key.verifying_key(), &entries[0]).unwrap();
        entries[0].body.meta_data = None;
        assert!(verify_message(&key.verifying_key(), &entries[0]).is_err());
    }
}
