//! Machine-id derivation
//!
//! The upstream fingerprints callers by a machine id. Deriving it from the
//! credential's profile ARN and client id keeps the id stable across
//! restarts for the same account; accounts without either field get a
//! random id that stays stable for the process lifetime (the account caches
//! it).

use rand::RngExt;
use sha2::{Digest, Sha256};

/// Derive a deterministic machine id from the credential identity.
///
/// `sha256(profileArn:clientId)` as lowercase hex. Falls back to a random
/// id when neither field is present.
pub fn derive_machine_id(profile_arn: Option<&str>, client_id: Option<&str>) -> String {
    if profile_arn.is_none() && client_id.is_none() {
        return random_machine_id();
    }
    let seed = format!(
        "{}:{}",
        profile_arn.unwrap_or_default(),
        client_id.unwrap_or_default()
    );
    let hash = Sha256::digest(seed.as_bytes());
    to_hex(&hash)
}

/// A random 64-char hex machine id.
pub fn random_machine_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    to_hex(&bytes)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
