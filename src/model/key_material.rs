use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::model::{Algorithm, Timestamp};

/// Version written into key metadata
pub const METADATA_VERSION: u32 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ed25519PublicKey([u8; 32]);

impl Ed25519PublicKey {
    pub fn from_slice(key: &[u8]) -> Result<Self, KeyMaterialError> {
        if key.len() != 32 {
            return Err(KeyMaterialError::InvalidLength {
                expected: 32,
                actual: key.len(),
            });
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(key);
        Ok(Self(bytes))
    }

    pub fn from_hex(encoded: &str) -> Result<Self, KeyMaterialError> {
        let bytes = hex::decode(encoded).map_err(|e| KeyMaterialError::InvalidEncoding {
            reason: e.to_string(),
        })?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_array(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse into a verifying key, rejecting points that are not on the curve
    pub fn to_verifying_key(&self) -> Result<VerifyingKey, KeyMaterialError> {
        VerifyingKey::from_bytes(&self.0).map_err(|e| KeyMaterialError::InvalidPoint {
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl From<VerifyingKey> for Ed25519PublicKey {
    fn from(key: VerifyingKey) -> Self {
        Self(*key.as_bytes())
    }
}

impl From<&VerifyingKey> for Ed25519PublicKey {
    fn from(key: &VerifyingKey) -> Self {
        Self(*key.as_bytes())
    }
}

impl From<&SigningKey> for Ed25519PublicKey {
    fn from(key: &SigningKey) -> Self {
        Self(*key.verifying_key().as_bytes())
    }
}

/// Opaque blob returned by the hardware root's seal operation
///
/// When no hardware root is present the blob is the raw private key, which
/// is why it is wiped on drop even though it is normally ciphertext.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SealedBlob(Vec<u8>);

impl SealedBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SealedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedBlob({} bytes)", self.0.len())
    }
}

/// One generation of signing key material, owned by the key manager
///
/// Superseded on rotation, never mutated.
pub struct KeyMaterial {
    pub(crate) public_key: Ed25519PublicKey,
    pub(crate) sealed_private_key: SealedBlob,
    pub(crate) algorithm: Algorithm,
    pub(crate) generation_time: Timestamp,
    pub(crate) hardware_protected: bool,
}

impl KeyMaterial {
    pub fn public_key(&self) -> &Ed25519PublicKey {
        &self.public_key
    }

    pub fn generation_time(&self) -> Timestamp {
        self.generation_time
    }

    pub fn hardware_protected(&self) -> bool {
        self.hardware_protected
    }

    pub fn descriptor(&self) -> KeyDescriptor {
        KeyDescriptor {
            public_key: self.public_key,
            algorithm: self.algorithm,
            generation_time: self.generation_time,
            hardware_protected: self.hardware_protected,
        }
    }

    pub(crate) fn metadata(&self) -> KeyMetadata {
        KeyMetadata {
            generation_time: self.generation_time,
            algorithm: self.algorithm,
            version: METADATA_VERSION,
            hardware_protected: self.hardware_protected,
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public_key", &self.public_key)
            .field("sealed_private_key", &self.sealed_private_key)
            .field("algorithm", &self.algorithm)
            .field("generation_time", &self.generation_time)
            .field("hardware_protected", &self.hardware_protected)
            .finish()
    }
}

/// Public view of a key generation handed out to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub public_key: Ed25519PublicKey,
    pub algorithm: Algorithm,
    pub generation_time: Timestamp,
    pub hardware_protected: bool,
}

/// Plaintext of the encrypted metadata record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub generation_time: Timestamp,
    pub algorithm: Algorithm,
    pub version: u32,
    pub hardware_protected: bool,
}

/// Public key of a past or present generation, kept for verifying history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedKey {
    pub generation_time: Timestamp,
    pub algorithm: Algorithm,
    #[serde(with = "hex_public_key")]
    pub public_key: Ed25519PublicKey,
}

mod hex_public_key {
    use super::Ed25519PublicKey;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &Ed25519PublicKey, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&key.to_hex())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Ed25519PublicKey, D::Error> {
        let encoded = String::deserialize(d)?;
        Ed25519PublicKey::from_hex(&encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterialError {
    #[error("Key must be exactly {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid key encoding: {reason}")]
    InvalidEncoding { reason: String },

    #[error("Invalid curve point: {reason}")]
    InvalidPoint { reason: String },
}
