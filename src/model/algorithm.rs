//! Signing algorithm identifiers and their key-size constants

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signing algorithm of a key generation
///
/// The identifier is persisted in key metadata and the public-key archive,
/// so every variant carries the exact byte lengths used to validate files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Algorithm {
    /// Ed25519 (EdDSA with Curve25519)
    Ed25519,
}

impl Algorithm {
    /// Default algorithm for vault signing keys
    pub fn default_signing() -> Self {
        Self::Ed25519
    }

    /// Stable identifier written to metadata
    pub fn id(self) -> &'static str {
        match self {
            Algorithm::Ed25519 => "ed25519",
        }
    }

    /// Parse a persisted identifier
    ///
    /// # Errors
    ///
    /// Returns `AlgorithmError::Unsupported` for unknown identifiers
    pub fn from_id(id: &str) -> Result<Self, AlgorithmError> {
        match id {
            "ed25519" => Ok(Algorithm::Ed25519),
            other => Err(AlgorithmError::Unsupported {
                algorithm: other.to_string(),
            }),
        }
    }

    /// Length of a public key file
    pub fn public_key_len(self) -> usize {
        match self {
            Algorithm::Ed25519 => ed25519_dalek::PUBLIC_KEY_LENGTH,
        }
    }

    /// Length of an unsealed private key
    pub fn private_key_len(self) -> usize {
        match self {
            Algorithm::Ed25519 => ed25519_dalek::SECRET_KEY_LENGTH,
        }
    }

    /// Length of a raw signature produced by the primitive
    pub fn signature_len(self) -> usize {
        match self {
            Algorithm::Ed25519 => ed25519_dalek::SIGNATURE_LENGTH,
        }
    }
}

impl TryFrom<String> for Algorithm {
    type Error = AlgorithmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Algorithm::from_id(&value)
    }
}

impl From<Algorithm> for String {
    fn from(alg: Algorithm) -> Self {
        alg.id().to_string()
    }
}

/// Errors that can occur when working with algorithms
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlgorithmError {
    /// Algorithm is not supported by sealkeep
    #[error("Algorithm not supported: {algorithm}")]
    Unsupported { algorithm: String },
}
