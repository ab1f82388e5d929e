pub mod keys;
pub mod signing;

pub use keys::{verifying_key_from_hex, Identity};
pub use signing::{canonical_json, sign_body, sign_bytes, verify_body, verify_signature};
