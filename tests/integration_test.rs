use std::sync::{Arc, Mutex};
use std::time::Duration;

use sealkeep::adapters::{
    EmulatedRoot, EntropyPool, FileKeyStore, FileLogStore, KeyStoreShredder, ManualClock,
};
use sealkeep::model::{AuthFactor, FactorSet, LogLevel, Timestamp};
use sealkeep::ports::{KeyRecord, LogStore, Terminator};
use sealkeep::vault::FailsafeState;
use sealkeep::{Collaborators, HardwareMode, VaultConfig, VaultCoordinator};
use tempfile::TempDir;

#[derive(Default)]
struct ExitCodes(Mutex<Vec<i32>>);

impl Terminator for ExitCodes {
    fn terminate(&self, code: i32) {
        self.0.lock().unwrap().push(code);
    }
}

fn config(dir: &TempDir) -> VaultConfig {
    let mut config = VaultConfig::default();
    config.keys.metadata_kdf_iterations = 1_000;
    config.storage.key_dir = dir.path().join("keys");
    config.storage.log_path = dir.path().join("audit.jsonl");
    config.storage.emulated_root_seed = dir.path().join("emulated-root.seed");
    config
}

#[test]
fn test_sign_rotate_restart_and_verify_offline() {
    let dir = TempDir::new().unwrap();
    let exits = Arc::new(ExitCodes::default());

    let vault = sealkeep::open_vault(config(&dir), HardwareMode::Emulated, exits.clone()).unwrap();
    let signature = vault.sign(b"release v1.2.3").unwrap();
    assert_eq!(signature.len(), 88);
    assert!(vault.verify(b"release v1.2.3", &signature).unwrap());

    let rotated = vault.rotate_keys().unwrap();
    assert!(vault.verify(b"release v1.2.3", &signature).unwrap());
    drop(vault);

    let vault = sealkeep::open_vault(config(&dir), HardwareMode::Emulated, exits.clone()).unwrap();
    assert_eq!(vault.active_key().unwrap(), rotated);
    assert!(vault.verify_log().unwrap());
    drop(vault);

    let report = sealkeep::verify_log_files(&config(&dir)).unwrap();
    assert!(report.intact);
    assert_eq!(
        sealkeep::read_public_key(&config(&dir)).unwrap(),
        Some(rotated.public_key)
    );
    assert!(exits.0.lock().unwrap().is_empty());
}

#[test]
fn test_edited_log_file_is_detected() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let vault =
        sealkeep::open_vault(config.clone(), HardwareMode::Absent, Arc::new(ExitCodes::default()))
            .unwrap();
    vault.append(LogLevel::Info, "balance 100").unwrap();
    drop(vault);

    let text = std::fs::read_to_string(&config.storage.log_path).unwrap();
    std::fs::write(
        &config.storage.log_path,
        text.replace("balance 100", "balance 900"),
    )
    .unwrap();

    let report = sealkeep::verify_log_files(&config).unwrap();
    assert!(!report.intact);
}

#[test]
fn test_missed_heartbeat_shreds_keys_and_terminates() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let clock = ManualClock::new(Timestamp::from_secs(1_700_000_000));
    let exits = Arc::new(ExitCodes::default());
    let key_store = Arc::new(FileKeyStore::open(&config.storage.key_dir).unwrap());

    let vault = VaultCoordinator::start(
        config.clone(),
        Collaborators {
            key_store: key_store.clone(),
            log_store: Arc::new(FileLogStore::open(&config.storage.log_path).unwrap()),
            entropy: EntropyPool::system_default(),
            hardware_root: Some(Arc::new(EmulatedRoot::new())),
            destructive: Arc::new(KeyStoreShredder::new(key_store.clone())),
            terminator: exits.clone(),
            clock: Arc::new(clock.clone()),
        },
    )
    .unwrap();
    assert!(key_store.path(KeyRecord::PublicKey).exists());

    vault
        .arm(&FactorSet::from([AuthFactor::Pin, AuthFactor::HardwareToken]))
        .unwrap();
    clock.advance(Duration::from_secs(61));
    assert_eq!(vault.tick(), FailsafeState::Triggered);

    assert_eq!(*exits.0.lock().unwrap(), vec![2]);
    for record in KeyRecord::ALL {
        assert!(!key_store.path(record).exists(), "{record:?} survived");
    }

    let entries = FileLogStore::open(&config.storage.log_path)
        .unwrap()
        .load_all()
        .unwrap();
    assert!(entries
        .iter()
        .any(|e| e.level == LogLevel::Critical && e.message.starts_with("failsafe triggered")));
    assert!(matches!(vault.sign(b"after"), Err(sealkeep::VaultError::Key(_))));
}
