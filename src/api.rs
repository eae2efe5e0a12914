//! File-backed entry points
//!
//! Wires the vault to the on-disk key store and audit log described by
//! [`StorageConfig`](crate::config::StorageConfig), with the system clock and
//! the key-store shredder as the failsafe's destructive action.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::adapters::{
    EmulatedRoot, EntropyPool, FileKeyStore, FileLogStore, KeyStoreShredder, SystemClock,
};
use crate::error::{KeyError, StorageError, VaultResult};
use crate::ports::{HardwareRoot, KeyRecord, KeyStore, LogStore, Terminator};
use crate::vault::{verify_chain, Collaborators, VaultCoordinator};

pub use crate::config::VaultConfig;
pub use crate::model::*;

const SEED_LEN: usize = 32;

/// Which hardware root the vault runs with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HardwareMode {
    /// No root; keys are stored unprotected and the degradation is logged
    #[default]
    Absent,
    /// Software root seeded from `storage.emulated_root_seed`
    Emulated,
}

/// Outcome of an offline log check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogReport {
    pub entries: usize,
    pub signed: usize,
    pub intact: bool,
}

/// Start a vault over the configured files
pub fn open_vault(
    config: VaultConfig,
    hardware: HardwareMode,
    terminator: Arc<dyn Terminator>,
) -> VaultResult<VaultCoordinator> {
    let key_store = Arc::new(FileKeyStore::open(&config.storage.key_dir)?);
    let log_store = Arc::new(FileLogStore::open(&config.storage.log_path)?);
    let entropy = EntropyPool::system_default();

    let hardware_root: Option<Arc<dyn HardwareRoot>> = match hardware {
        HardwareMode::Absent => None,
        HardwareMode::Emulated => Some(Arc::new(load_emulated_root(
            &config.storage.emulated_root_seed,
            &entropy,
        )?)),
    };

    VaultCoordinator::start(
        config,
        Collaborators {
            key_store: key_store.clone(),
            log_store,
            entropy,
            hardware_root,
            destructive: Arc::new(KeyStoreShredder::new(key_store)),
            terminator,
            clock: Arc::new(SystemClock),
        },
    )
}

/// Load the emulated root's seed, creating it on first use
pub fn load_emulated_root(path: &Path, entropy: &EntropyPool) -> VaultResult<EmulatedRoot> {
    match fs::read(path) {
        Ok(bytes) => {
            let seed: [u8; SEED_LEN] = bytes.as_slice().try_into().map_err(|_| {
                StorageError::InvalidRecord {
                    record: path.display().to_string(),
                    reason: format!("expected {SEED_LEN} bytes, found {}", bytes.len()),
                }
            })?;
            Ok(EmulatedRoot::from_seed(&seed))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(
                "Creating emulated hardware root seed at {}; not for production use",
                path.display()
            );
            let seed = entropy.get_random(SEED_LEN)?;
            write_seed(path, seed.as_slice())?;
            let seed = seed.as_array::<SEED_LEN>().ok_or_else(|| StorageError::InvalidRecord {
                record: path.display().to_string(),
                reason: "short read from entropy pool".to_string(),
            })?;
            Ok(EmulatedRoot::from_seed(seed))
        }
        Err(e) => Err(StorageError::io(path, e).into()),
    }
}

fn write_seed(path: &Path, seed: &[u8]) -> VaultResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).map_err(|e| StorageError::io(path, e))?;
    file.write_all(seed)
        .and_then(|()| file.sync_all())
        .map_err(|e| StorageError::io(path, e))?;
    Ok(())
}

/// Active public key as stored on disk, without starting the vault
pub fn read_public_key(config: &VaultConfig) -> VaultResult<Option<Ed25519PublicKey>> {
    let store = FileKeyStore::open(&config.storage.key_dir)?;
    let Some(bytes) = store.read(KeyRecord::PublicKey)? else {
        return Ok(None);
    };
    let key = Ed25519PublicKey::from_slice(&bytes).map_err(|e| KeyError::Load {
        reason: format!("{}: {e}", KeyRecord::PublicKey.file_name()),
    })?;
    Ok(Some(key))
}

/// Verify the audit log on disk against the stored public key archive
pub fn verify_log_files(config: &VaultConfig) -> VaultResult<LogReport> {
    let store = FileKeyStore::open(&config.storage.key_dir)?;
    let archive: Vec<ArchivedKey> = match store.read(KeyRecord::PublicKeyArchive)? {
        None => Vec::new(),
        Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| KeyError::Load {
            reason: format!("{}: {e}", KeyRecord::PublicKeyArchive.file_name()),
        })?,
    };

    let entries = FileLogStore::open(&config.storage.log_path)?.load_all()?;
    let report = LogReport {
        entries: entries.len(),
        signed: entries.iter().filter(|e| e.signature.is_some()).count(),
        intact: verify_chain(&entries, &archive),
    };
    info!(
        "Checked {} audit entries against {} archived keys",
        report.entries,
        archive.len()
    );
    Ok(report)
}
