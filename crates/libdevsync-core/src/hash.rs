use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use crate::error::DevsyncError;
use crate::types::state::MaterializedState;

/// BLAKE2b-256 digest of a state
pub type Fingerprint = [u8; 32];

/// Fingerprint a materialized state over its canonical JSON encoding.
///
/// Maps are `BTreeMap`s and project order is part of the state, so equal
/// states always encode to the same bytes.
pub fn state_fingerprint(state: &MaterializedState) -> Result<Fingerprint, DevsyncError> {
    let preimage = serde_json::to_vec(state)?;
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(&preimage);
    Ok(hasher.finalize().into())
}

pub fn fingerprint_hex(fingerprint: &Fingerprint) -> String {
    hex::encode(fingerprint)
}

/// Hex BLAKE2b-256 digest of raw bytes
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
