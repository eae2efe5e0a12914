//! Error types for sealkeep
//!
//! This module defines the error hierarchy for all vault operations.
//! Errors are organized per component and use thiserror for implementation.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for vault operations
///
/// This is a convenience alias for `Result<T, VaultError>`.
pub type VaultResult<T> = Result<T, VaultError>;

/// Top-level error type for all vault operations
#[derive(Error, Debug)]
pub enum VaultError {
    /// Entropy source errors
    #[error("Entropy error: {0}")]
    Entropy(#[from] EntropyError),

    /// Hardware root of trust errors
    #[error("Hardware root error: {0}")]
    Hardware(#[from] HardwareError),

    /// Key lifecycle errors
    #[error("Key lifecycle error: {0}")]
    Key(#[from] KeyError),

    /// Tamper-evident log errors
    #[error("Tamper-evident log error: {0}")]
    Log(#[from] LogError),

    /// Failsafe monitor errors
    #[error("Failsafe error: {0}")]
    Failsafe(#[from] FailsafeError),

    /// Persistent storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl VaultError {
    /// Whether the error must abort the surrounding operation and be recorded
    /// at CRITICAL level.
    pub fn is_fatal(&self) -> bool {
        match self {
            VaultError::Entropy(_) | VaultError::Key(_) | VaultError::Log(_) => true,
            VaultError::Hardware(_) | VaultError::Storage(_) => false,
            VaultError::Failsafe(_) | VaultError::Config(_) => false,
        }
    }
}

/// Entropy source errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntropyError {
    /// Every configured source failed or reported itself unhealthy
    #[error("No entropy available, tried sources: {}", attempted.join(", "))]
    Unavailable { attempted: Vec<String> },
}

/// Hardware root of trust errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    /// A hardware call did not complete in time
    #[error("Hardware operation '{operation}' timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Sealing a blob failed
    #[error("Failed to seal data: {reason}")]
    Seal { reason: String },

    /// Unsealing a blob failed
    #[error("Failed to unseal data: {reason}")]
    Unseal { reason: String },

    /// Producing an attestation quote failed
    #[error("Failed to produce attestation quote: {reason}")]
    Quote { reason: String },

    /// Extending or reading a register failed
    #[error("Register {register} operation failed: {reason}")]
    Register { register: u32, reason: String },

    /// The hardware worker is gone
    #[error("Hardware root unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Key lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Key generation failed
    #[error("Failed to generate key: {reason}")]
    Generation { reason: String },

    /// Persisted key material is missing, corrupt or inconsistent
    #[error("Failed to load key: {reason}")]
    Load { reason: String },

    /// Signing failed
    #[error("Failed to sign: {reason}")]
    Signing { reason: String },

    /// Signature bytes do not have the bound-signature layout
    #[error("Malformed signature: expected {expected} bytes, got {actual}")]
    MalformedSignature { expected: usize, actual: usize },

    /// Key material has been wiped by shutdown or the failsafe
    #[error("Key material has been wiped")]
    Wiped,
}

/// Tamper-evident log errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// The entry could not be durably stored; the chain did not advance
    #[error("Failed to persist log entry {sequence_no}: {reason}")]
    Persist { sequence_no: u64, reason: String },

    /// Persisted log does not replay to a consistent chain
    #[error("Log corrupted at entry {sequence_no}: {reason}")]
    Corrupted { sequence_no: u64, reason: String },

    /// Entry could not be encoded or decoded
    #[error("Log serialization error: {reason}")]
    Serialization { reason: String },
}

/// Failsafe monitor errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailsafeError {
    /// Heartbeat received while not armed under strict mode
    #[error("Failsafe is not armed (state: {state})")]
    NotArmed { state: String },

    /// Presented factors do not cover the required set
    #[error("Insufficient authentication factors, missing: {}", missing.join(", "))]
    InsufficientFactors { missing: Vec<String> },

    /// The failsafe has already fired
    #[error("Failsafe already triggered")]
    Triggered,
}

/// Persistent storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying filesystem error
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record exists but cannot be interpreted
    #[error("Invalid record {record}: {reason}")]
    InvalidRecord { record: String, reason: String },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for `VaultConfig`
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config values are inconsistent
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Convert ed25519_dalek signature errors
impl From<ed25519_dalek::SignatureError> for VaultError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        VaultError::Key(KeyError::Signing {
            reason: err.to_string(),
        })
    }
}

/// Convert serde_json errors raised while encoding log entries
impl From<serde_json::Error> for LogError {
    fn from(err: serde_json::Error) -> Self {
        LogError::Serialization {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VaultError::Entropy(EntropyError::Unavailable {
            attempted: vec!["os".to_string(), "thread-rng".to_string()],
        });
        assert!(err.to_string().contains("os, thread-rng"));
    }

    #[test]
    fn test_fatal_classification() {
        let persist = VaultError::Log(LogError::Persist {
            sequence_no: 3,
            reason: "disk full".to_string(),
        });
        assert!(persist.is_fatal());

        let not_armed = VaultError::Failsafe(FailsafeError::NotArmed {
            state: "Disarmed".to_string(),
        });
        assert!(!not_armed.is_fatal());
    }

    #[test]
    fn test_result_type_alias() {
        let result: VaultResult<i32> = Ok(42);
        assert_eq!(result.unwrap(), 42);

        let result: VaultResult<i32> = Err(VaultError::Key(KeyError::Wiped));
        assert!(result.is_err());
    }

    #[test]
    fn test_storage_error_mentions_path() {
        let err = StorageError::io(
            "/tmp/vault/signing.pub",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("signing.pub"));
    }
}
