use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::error::KeyError;
use crate::model::SecureBuffer;

/// Length of the IV that prefixes the metadata ciphertext
pub const IV_LEN: usize = 16;

/// Length of the sealed seed the metadata key is derived from
pub const SEED_LEN: usize = 32;

const KDF_SALT: &[u8] = b"sealkeep/metadata-key/v1";

/// AES-256-GCM with a 16-byte IV
type MetadataAead = AesGcm<Aes256, U16>;

/// Encrypts the key metadata record
///
/// The key is derived with PBKDF2-HMAC-SHA256 from a persisted seed, so the
/// same key is re-derived on every load.
pub struct MetadataCipher {
    key: SecureBuffer,
}

impl MetadataCipher {
    pub fn derive(seed: &SecureBuffer, iterations: u32) -> Self {
        let mut key = SecureBuffer::new(32);
        pbkdf2_hmac::<Sha256>(seed.as_slice(), KDF_SALT, iterations, key.as_mut_slice());
        Self { key }
    }

    /// Encrypt into `iv ‖ ciphertext`
    pub fn seal(&self, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
        let ciphertext = self
            .aead()?
            .encrypt(Nonce::<U16>::from_slice(iv), plaintext)
            .map_err(|_| KeyError::Generation {
                reason: "metadata encryption failed".to_string(),
            })?;

        let mut record = Vec::with_capacity(IV_LEN + ciphertext.len());
        record.extend_from_slice(iv);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Decrypt an `iv ‖ ciphertext` record
    pub fn open(&self, record: &[u8]) -> Result<Vec<u8>, KeyError> {
        if record.len() <= IV_LEN {
            return Err(KeyError::Load {
                reason: format!("metadata record too short: {} bytes", record.len()),
            });
        }
        let (iv, ciphertext) = record.split_at(IV_LEN);
        self.aead()?
            .decrypt(Nonce::<U16>::from_slice(iv), ciphertext)
            .map_err(|_| KeyError::Load {
                reason: "metadata authentication failed".to_string(),
            })
    }

    fn aead(&self) -> Result<MetadataAead, KeyError> {
        MetadataAead::new_from_slice(self.key.as_slice()).map_err(|e| KeyError::Load {
            reason: format!("metadata key: {e}"),
        })
    }
}
