//! KeyStore trait - durable storage for key records

use crate::error::VaultResult;

/// Records persisted for the active key generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRecord {
    /// Raw public key bytes
    PublicKey,
    /// Hardware-sealed private key
    SealedPrivateKey,
    /// `iv ‖ ciphertext` of the key metadata; written last
    Metadata,
    /// Hardware-sealed seed of the metadata encryption key
    MetadataSeed,
    /// Monotonic signature counter (u64 big-endian)
    SignatureCounter,
    /// JSON list of every public key ever generated
    PublicKeyArchive,
}

impl KeyRecord {
    pub const ALL: [KeyRecord; 6] = [
        KeyRecord::PublicKey,
        KeyRecord::SealedPrivateKey,
        KeyRecord::Metadata,
        KeyRecord::MetadataSeed,
        KeyRecord::SignatureCounter,
        KeyRecord::PublicKeyArchive,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            KeyRecord::PublicKey => "signing.pub",
            KeyRecord::SealedPrivateKey => "signing.sealed",
            KeyRecord::Metadata => "signing.meta",
            KeyRecord::MetadataSeed => "metadata.seal",
            KeyRecord::SignatureCounter => "signature.counter",
            KeyRecord::PublicKeyArchive => "public_keys.json",
        }
    }
}

/// Capability to persist key records
///
/// Every write must be atomic: a reader sees either the previous content or
/// the new content, never a partial record.
pub trait KeyStore: Send + Sync {
    /// Read a record, `None` if it was never written
    fn read(&self, record: KeyRecord) -> VaultResult<Option<Vec<u8>>>;

    /// Replace a record atomically with owner-only permissions
    fn write_atomic(&self, record: KeyRecord, bytes: &[u8]) -> VaultResult<()>;

    /// Overwrite and delete every record
    fn shred(&self) -> VaultResult<()>;
}
