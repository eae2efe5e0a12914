//! Hardware-rooted secret management core
//!
//! Signing keys sealed by a hardware root of trust, a hash-chained signed
//! audit log, and a dead-man's-switch failsafe, brought together by
//! [`VaultCoordinator`].

pub mod adapters;
pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod ports;
pub mod vault;

// Re-export commonly used types
pub use config::VaultConfig;
pub use error::{VaultError, VaultResult};
pub use vault::{Collaborators, VaultCoordinator, VaultStatus};

// Re-export public API
pub use api::{open_vault, read_public_key, verify_log_files, HardwareMode, LogReport};
