//! Domain types for the vault
//!
//! This module defines domain-specific types that wrap primitives to:
//! - Prevent primitive obsession
//! - Enforce invariants at construction
//! - Keep secret bytes out of `Debug` output

mod algorithm;
mod factor;
mod key_material;
mod log_entry;
mod secure_buffer;
mod timestamp;

pub use algorithm::{Algorithm, AlgorithmError};
pub use factor::{AuthFactor, FactorError, FactorSet};
pub use key_material::{
    ArchivedKey, Ed25519PublicKey, KeyDescriptor, KeyMaterial, KeyMaterialError, KeyMetadata,
    SealedBlob, METADATA_VERSION,
};
pub use log_entry::{ChainCheckpoint, HashDigest, LogEntry, LogLevel};
pub use secure_buffer::SecureBuffer;
pub use timestamp::Timestamp;

pub(crate) use timestamp::duration_millis;
