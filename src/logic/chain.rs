//! Hash-chain computation for the tamper-evident log

use sha2::{Digest, Sha256};

use crate::model::{HashDigest, LogLevel, Timestamp};

const GENESIS_LABEL: &[u8] = b"sealkeep/tamper-evident-log/genesis/v1";
const ENTRY_DOMAIN: &[u8] = b"sealkeep/log-entry/v1";

/// Chain digest that precedes the first entry
pub fn genesis_digest() -> HashDigest {
    HashDigest::new(Sha256::digest(GENESIS_LABEL).into())
}

/// Digest of one entry's own fields
///
/// Integers are big-endian and the variable-length fields are
/// length-prefixed, so no two distinct entries share an encoding.
pub fn entry_digest(
    sequence_no: u64,
    timestamp: Timestamp,
    level: LogLevel,
    message: &str,
) -> HashDigest {
    let level = level.as_str().as_bytes();
    let mut hasher = Sha256::new();
    hasher.update(ENTRY_DOMAIN);
    hasher.update(sequence_no.to_be_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update((level.len() as u64).to_be_bytes());
    hasher.update(level);
    hasher.update((message.len() as u64).to_be_bytes());
    hasher.update(message.as_bytes());
    HashDigest::new(hasher.finalize().into())
}

/// `Hash(previous chain digest ‖ entry digest)`
pub fn chain_digest(previous: &HashDigest, entry: &HashDigest) -> HashDigest {
    let mut hasher = Sha256::new();
    hasher.update(previous.as_bytes());
    hasher.update(entry.as_bytes());
    HashDigest::new(hasher.finalize().into())
}
