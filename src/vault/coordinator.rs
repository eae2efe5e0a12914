//! Vault coordinator
//!
//! Brings the components up in order (log, entropy, hardware, keys,
//! failsafe) and is the single entry point callers use afterwards. There is
//! no global instance; whoever starts the vault owns it.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::adapters::{EntropyPool, HardwareCapability};
use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::logic::BoundSignature;
use crate::model::{
    ArchivedKey, ChainCheckpoint, FactorSet, KeyDescriptor, LogEntry, LogLevel,
};
use crate::ports::{
    Clock, DestructiveAction, HardwareRoot, KeyStore, LogStore, Terminator, SHUTDOWN_REGISTER,
};

use super::background::BackgroundTasks;
use super::failsafe::{FailsafeMonitor, FailsafeState, HeartbeatState};
use super::key_manager::KeyLifecycleManager;
use super::shutdown::{ShutdownSequence, EMERGENCY_EXIT_CODE};
use super::tamper_log::TamperEvidentLog;

/// Everything the vault needs from the outside world
pub struct Collaborators {
    pub key_store: Arc<dyn KeyStore>,
    pub log_store: Arc<dyn LogStore>,
    pub entropy: EntropyPool,
    /// `None` runs the vault in degraded mode without hardware protection
    pub hardware_root: Option<Arc<dyn HardwareRoot>>,
    pub destructive: Arc<dyn DestructiveAction>,
    pub terminator: Arc<dyn Terminator>,
    pub clock: Arc<dyn Clock>,
}

/// Failsafe action: drop the keys from memory, then run the configured
/// destruction
struct WipeThenDestroy {
    keys: Arc<KeyLifecycleManager>,
    inner: Arc<dyn DestructiveAction>,
}

impl DestructiveAction for WipeThenDestroy {
    fn destroy(&self) -> VaultResult<()> {
        self.keys.wipe();
        self.inner.destroy()
    }
}

/// Point-in-time view of the vault
#[derive(Debug, Clone)]
pub struct VaultStatus {
    pub active_key: Option<KeyDescriptor>,
    pub hardware: String,
    pub hardware_present: bool,
    pub log_head: ChainCheckpoint,
    pub failsafe: HeartbeatState,
    pub shut_down: bool,
}

pub struct VaultCoordinator {
    config: VaultConfig,
    clock: Arc<dyn Clock>,
    log: Arc<TamperEvidentLog>,
    keys: Arc<KeyLifecycleManager>,
    hardware: Arc<HardwareCapability>,
    monitor: FailsafeMonitor,
    shutdown: Arc<ShutdownSequence>,
}

/// Startup events held back until the log can sign them
///
/// A log that already holds signed entries only takes unsigned CRITICAL
/// entries, so nothing is appended before the key manager is attached as
/// signer.
#[derive(Default)]
struct StartupJournal {
    log: Option<Arc<TamperEvidentLog>>,
    pending: Vec<(LogLevel, String)>,
}

impl StartupJournal {
    fn note(&mut self, level: LogLevel, message: impl Into<String>) {
        self.pending.push((level, message.into()));
    }

    fn flush(&mut self) -> VaultResult<()> {
        let Some(log) = self.log.as_ref() else {
            return Ok(());
        };
        for (level, message) in self.pending.drain(..) {
            log.append(level, &message)?;
        }
        Ok(())
    }

    fn flush_best_effort(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Could not record startup events: {}", e);
            self.pending.clear();
        }
    }
}

impl VaultCoordinator {
    /// Start the vault
    ///
    /// On any failure the events recorded so far are flushed when possible,
    /// the shutdown sequence runs with the emergency exit code, and the
    /// error is returned.
    pub fn start(config: VaultConfig, collaborators: Collaborators) -> VaultResult<Self> {
        let shutdown = Arc::new(ShutdownSequence::new(collaborators.terminator.clone()));
        let mut journal = StartupJournal::default();

        match Self::bring_up(config, collaborators, &shutdown, &mut journal) {
            Ok(vault) => Ok(vault),
            Err(e) => {
                error!("Vault startup failed: {}", e);
                journal.flush_best_effort();
                shutdown.run(&format!("startup failed: {e}"), EMERGENCY_EXIT_CODE);
                Err(e)
            }
        }
    }

    fn bring_up(
        config: VaultConfig,
        collaborators: Collaborators,
        shutdown: &Arc<ShutdownSequence>,
        journal: &mut StartupJournal,
    ) -> VaultResult<Self> {
        config.validate()?;
        let Collaborators {
            key_store,
            log_store,
            entropy,
            hardware_root,
            destructive,
            terminator: _,
            clock,
        } = collaborators;

        let log = Arc::new(TamperEvidentLog::open(
            log_store,
            clock.clone(),
            config.log.clone(),
        )?);
        shutdown.attach_audit(log.clone());
        journal.log = Some(log.clone());
        journal.note(
            LogLevel::Info,
            format!(
                "vault starting, audit log resumes at entry {}",
                log.checkpoint().next_sequence_no
            ),
        );

        entropy.get_random(32)?;
        journal.note(
            LogLevel::Info,
            format!("entropy sources: {}", entropy.source_names().join(", ")),
        );

        let hardware = match hardware_root {
            Some(root) => {
                let capability = HardwareCapability::present(root, config.hardware.timeout())?;
                capability.read_register(SHUTDOWN_REGISTER)?;
                info!("Hardware root '{}' is present", capability.name());
                journal.note(
                    LogLevel::Info,
                    format!("hardware root '{}' present", capability.name()),
                );
                capability
            }
            None => {
                warn!("No hardware root, running without hardware protection");
                journal.note(
                    LogLevel::Warning,
                    "no hardware root present, running in degraded mode",
                );
                HardwareCapability::absent()
            }
        };
        let hardware = Arc::new(hardware);
        log.attach_attestor(hardware.clone());
        shutdown.attach_hardware(hardware.clone());

        let keys = Arc::new(KeyLifecycleManager::new(
            key_store,
            entropy,
            hardware.clone(),
            clock.clone(),
            config.keys.clone(),
        ));
        shutdown.attach_keys(keys.clone());
        let descriptor = keys.load_or_rotate()?;
        log.attach_signer(keys.clone());
        journal.flush()?;

        log.append(
            LogLevel::Info,
            &format!(
                "signing key {} from {} active",
                descriptor.public_key.to_hex(),
                descriptor.generation_time
            ),
        )?;
        if !descriptor.hardware_protected {
            log.append(
                LogLevel::Warning,
                "signing key is stored without hardware protection",
            )?;
        }

        let monitor = FailsafeMonitor::new(
            config.failsafe.clone(),
            clock.clone(),
            Arc::new(WipeThenDestroy {
                keys: keys.clone(),
                inner: destructive,
            }),
            log.clone(),
            shutdown.clone(),
        );

        log.append(LogLevel::Info, "vault started")?;
        info!("Vault started");

        Ok(Self {
            config,
            clock,
            log,
            keys,
            hardware,
            monitor,
            shutdown: shutdown.clone(),
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Record fatal errors at CRITICAL before handing them back
    fn fatal(&self, err: VaultError) -> VaultError {
        if err.is_fatal() {
            error!("Fatal vault error: {}", err);
            if let Err(e) = self.log.append(LogLevel::Critical, &format!("fatal error: {err}")) {
                error!("Could not record fatal error: {}", e);
            }
        }
        err
    }

    /// Sign `payload` with the active key and record the operation
    pub fn sign(&self, payload: &[u8]) -> VaultResult<Vec<u8>> {
        let signature = self.keys.sign(payload).map_err(|e| self.fatal(e))?;
        let counter = BoundSignature::from_bytes(&signature)
            .map(|bound| bound.context.counter)
            .map_err(|e| self.fatal(e.into()))?;

        let payload_hash = hex::encode(Sha256::digest(payload));
        self.log
            .append(
                LogLevel::Info,
                &format!("signature {counter} issued over payload sha256:{payload_hash}"),
            )
            .map_err(|e| self.fatal(e))?;
        Ok(signature)
    }

    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> VaultResult<bool> {
        let valid = self.keys.verify(payload, signature)?;
        if !valid {
            debug!("Signature rejected");
        }
        Ok(valid)
    }

    /// Add a caller-supplied entry to the audit log
    pub fn append(&self, level: LogLevel, message: &str) -> VaultResult<LogEntry> {
        self.log.append(level, message).map_err(|e| self.fatal(e))
    }

    /// Verify the whole persisted log against the public key archive
    ///
    /// A failed check is recorded at CRITICAL.
    pub fn verify_log(&self) -> VaultResult<bool> {
        let archive = self.keys.archive();
        let intact = self.log.verify_persisted(&archive)?;
        if intact {
            debug!("Audit log integrity verified");
        } else {
            error!("Audit log integrity check failed");
            if let Err(e) = self
                .log
                .append(LogLevel::Critical, "audit log integrity check failed")
            {
                error!("Could not record integrity failure: {}", e);
            }
        }
        Ok(intact)
    }

    pub fn rotate_keys(&self) -> VaultResult<KeyDescriptor> {
        let descriptor = self.keys.rotate().map_err(|e| self.fatal(e))?;
        self.record_rotation(&descriptor)?;
        Ok(descriptor)
    }

    /// Rotate when the active key is past its interval
    pub fn rotate_if_due(&self) -> VaultResult<Option<KeyDescriptor>> {
        let rotated = self.keys.rotate_if_due().map_err(|e| self.fatal(e))?;
        if let Some(descriptor) = rotated.as_ref() {
            self.record_rotation(descriptor)?;
        }
        Ok(rotated)
    }

    /// Erase retired keys past their grace period
    pub fn prune_retired(&self) -> VaultResult<usize> {
        let pruned = self.keys.prune_retired();
        if pruned > 0 {
            self.log.append(
                LogLevel::Info,
                &format!("erased {pruned} retired signing key(s)"),
            )?;
        }
        Ok(pruned)
    }

    // Called after the key lock is released.
    fn record_rotation(&self, descriptor: &KeyDescriptor) -> VaultResult<()> {
        info!(
            "Rotated signing key to {}",
            descriptor.public_key.to_hex()
        );
        self.log
            .append(
                LogLevel::Info,
                &format!(
                    "signing key rotated to {} from {}",
                    descriptor.public_key.to_hex(),
                    descriptor.generation_time
                ),
            )
            .map_err(|e| self.fatal(e))?;
        Ok(())
    }

    pub fn heartbeat(&self) -> VaultResult<()> {
        self.monitor.heartbeat()
    }

    pub fn begin_arming(&self) -> VaultResult<FailsafeState> {
        self.monitor.begin_arming()
    }

    pub fn arm(&self, factors: &FactorSet) -> VaultResult<FailsafeState> {
        self.monitor.arm(factors)
    }

    pub fn disarm(&self, factors: &FactorSet) -> VaultResult<FailsafeState> {
        self.monitor.disarm(factors)
    }

    pub fn trigger_explicit(&self, factors: &FactorSet) -> VaultResult<()> {
        self.monitor.trigger_explicit(factors)
    }

    /// Check the failsafe deadline against the current time
    pub fn tick(&self) -> FailsafeState {
        self.monitor.tick(self.clock.now())
    }

    pub fn status(&self) -> VaultStatus {
        VaultStatus {
            active_key: self.keys.active(),
            hardware: self.hardware.name().to_string(),
            hardware_present: self.hardware.is_present(),
            log_head: self.log.checkpoint(),
            failsafe: self.monitor.status(),
            shut_down: self.shutdown.has_run(),
        }
    }

    pub fn active_key(&self) -> Option<KeyDescriptor> {
        self.keys.active()
    }

    pub fn public_key_archive(&self) -> Vec<ArchivedKey> {
        self.keys.archive()
    }

    pub fn log_entries(&self) -> VaultResult<Vec<LogEntry>> {
        self.log.entries()
    }

    /// Orderly shutdown with exit code 0
    ///
    /// Returns `false` if a shutdown already ran.
    pub fn shutdown(&self, reason: &str) -> bool {
        self.shutdown.run(reason, 0)
    }

    /// Start the failsafe tick, key rotation and integrity scan threads
    pub fn spawn_background(self: &Arc<Self>) -> std::io::Result<BackgroundTasks> {
        BackgroundTasks::spawn(self.clone(), &self.config.background)
    }
}

impl std::fmt::Debug for VaultCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultCoordinator")
            .field("keys", &self.keys)
            .field("hardware", &self.hardware)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fakes::{
        BrokenEntropy, FailingLogStore, RecordingAction, RecordingTerminator,
    };
    use crate::adapters::{EmulatedRoot, ManualClock, MemoryKeyStore, MemoryLogStore};
    use crate::error::{EntropyError, FailsafeError, KeyError};
    use crate::model::{AuthFactor, Timestamp};
    use crate::ports::KeyRecord;
    use crate::vault::verify_chain;
    use std::time::Duration;

    const T0: Timestamp = Timestamp::from_secs(1_700_000_000);

    struct Fixture {
        key_store: MemoryKeyStore,
        log_store: MemoryLogStore,
        root: Arc<EmulatedRoot>,
        clock: ManualClock,
        action: RecordingAction,
        terminator: RecordingTerminator,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                key_store: MemoryKeyStore::new(),
                log_store: MemoryLogStore::new(),
                root: Arc::new(EmulatedRoot::new()),
                clock: ManualClock::new(T0),
                action: RecordingAction::new(),
                terminator: RecordingTerminator::new(),
            }
        }

        fn config() -> VaultConfig {
            let mut config = VaultConfig::default();
            config.keys.metadata_kdf_iterations = 1_000;
            config
        }

        fn collaborators(&self, with_hardware: bool) -> Collaborators {
            Collaborators {
                key_store: Arc::new(self.key_store.clone()),
                log_store: Arc::new(self.log_store.clone()),
                entropy: EntropyPool::system_default(),
                hardware_root: with_hardware.then(|| self.root.clone() as Arc<dyn HardwareRoot>),
                destructive: Arc::new(self.action.clone()),
                terminator: Arc::new(self.terminator.clone()),
                clock: Arc::new(self.clock.clone()),
            }
        }

        fn start(&self) -> VaultCoordinator {
            VaultCoordinator::start(Self::config(), self.collaborators(true)).unwrap()
        }

        fn messages(&self) -> Vec<String> {
            self.log_store
                .load_all()
                .unwrap()
                .into_iter()
                .map(|e| e.message)
                .collect()
        }
    }

    fn arming_factors() -> FactorSet {
        FactorSet::from([AuthFactor::Pin, AuthFactor::HardwareToken])
    }

    #[test]
    fn test_start_records_startup_and_signs_everything() {
        let fx = Fixture::new();
        let vault = fx.start();

        let status = vault.status();
        assert!(status.hardware_present);
        assert!(status.active_key.unwrap().hardware_protected);

        let entries = fx.log_store.load_all().unwrap();
        assert!(entries.iter().all(|e| e.signature.is_some()));
        assert!(entries.iter().all(|e| e.attestation.is_some()));
        assert_eq!(entries.last().unwrap().message, "vault started");
        assert!(verify_chain(&entries, &vault.public_key_archive()));
    }

    #[test]
    fn test_restart_resumes_log_and_key() {
        let fx = Fixture::new();
        let first = fx.start();
        let key = first.active_key().unwrap();
        let head = first.status().log_head;
        drop(first);

        let second = fx.start();
        assert_eq!(second.active_key().unwrap(), key);
        assert!(second.status().log_head.next_sequence_no > head.next_sequence_no);
        assert!(second.verify_log().unwrap());
    }

    #[test]
    fn test_start_without_hardware_is_degraded() {
        let fx = Fixture::new();
        let vault =
            VaultCoordinator::start(Fixture::config(), fx.collaborators(false)).unwrap();

        let status = vault.status();
        assert!(!status.hardware_present);
        assert_eq!(status.hardware, "none");
        assert!(!status.active_key.unwrap().hardware_protected);

        let warnings: Vec<_> = fx
            .log_store
            .load_all()
            .unwrap()
            .into_iter()
            .filter(|e| e.level == LogLevel::Warning)
            .collect();
        assert_eq!(warnings.len(), 2);
        assert!(vault.verify_log().unwrap());
    }

    #[test]
    fn test_start_failure_shuts_down() {
        let fx = Fixture::new();
        let mut collaborators = fx.collaborators(true);
        collaborators.entropy = EntropyPool::new(Arc::new(BrokenEntropy));

        let result = VaultCoordinator::start(Fixture::config(), collaborators);
        assert!(matches!(
            result,
            Err(VaultError::Entropy(EntropyError::Unavailable { .. }))
        ));
        assert_eq!(fx.terminator.codes(), vec![EMERGENCY_EXIT_CODE]);

        let entries = fx.log_store.load_all().unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.level, LogLevel::Critical);
        assert!(last.message.contains("startup failed"));
        assert!(verify_chain(&entries, &[]));
    }

    #[test]
    fn test_key_load_failure_on_restart_is_recorded() {
        let fx = Fixture::new();
        let first = fx.start();
        let archive = first.public_key_archive();
        let before = fx.log_store.len();
        drop(first);

        fx.key_store
            .write_atomic(KeyRecord::PublicKey, &[7u8; 16])
            .unwrap();
        let result = VaultCoordinator::start(Fixture::config(), fx.collaborators(true));
        assert!(matches!(result, Err(VaultError::Key(KeyError::Load { .. }))));
        assert_eq!(fx.terminator.codes(), vec![EMERGENCY_EXIT_CODE]);

        let entries = fx.log_store.load_all().unwrap();
        assert_eq!(entries.len(), before + 1);
        let last = entries.last().unwrap();
        assert_eq!(last.level, LogLevel::Critical);
        assert!(last.message.contains("startup failed"));
        assert!(last.message.contains("public key"));
        assert!(verify_chain(&entries, &archive));
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let fx = Fixture::new();
        let mut config = Fixture::config();
        config.failsafe.heartbeat_timeout_secs = 0;

        assert!(matches!(
            VaultCoordinator::start(config, fx.collaborators(true)),
            Err(VaultError::Config(_))
        ));
        assert_eq!(fx.terminator.codes(), vec![EMERGENCY_EXIT_CODE]);
    }

    #[test]
    fn test_sign_is_audited() {
        let fx = Fixture::new();
        let vault = fx.start();

        let signature = vault.sign(b"transfer 10").unwrap();
        assert!(vault.verify(b"transfer 10", &signature).unwrap());
        assert!(!vault.verify(b"transfer 11", &signature).unwrap());

        let expected = hex::encode(Sha256::digest(b"transfer 10"));
        assert!(fx.messages().iter().any(|m| m.contains(&expected)));
    }

    #[test]
    fn test_sign_fails_when_log_cannot_persist() {
        let fx = Fixture::new();
        let store = FailingLogStore::new();
        let mut collaborators = fx.collaborators(true);
        collaborators.log_store = Arc::new(store.clone());
        let vault = VaultCoordinator::start(Fixture::config(), collaborators).unwrap();

        let head = vault.status().log_head;
        store.set_failing(true);
        assert!(matches!(vault.sign(b"payload"), Err(VaultError::Log(_))));
        assert_eq!(vault.status().log_head, head);
    }

    #[test]
    fn test_rotation_is_logged_and_old_entries_verify() {
        let fx = Fixture::new();
        let vault = fx.start();
        let before = vault.active_key().unwrap();

        fx.clock.advance(Duration::from_secs(10));
        let after = vault.rotate_keys().unwrap();
        assert!(after.generation_time > before.generation_time);
        assert_eq!(vault.public_key_archive().len(), 2);
        assert!(fx
            .messages()
            .iter()
            .any(|m| m.contains(&after.public_key.to_hex())));
        assert!(vault.verify_log().unwrap());
    }

    #[test]
    fn test_rotate_if_due_and_prune() {
        let fx = Fixture::new();
        let vault = fx.start();
        assert!(vault.rotate_if_due().unwrap().is_none());

        fx.clock.advance(Duration::from_secs(24 * 60 * 60 + 1));
        assert!(vault.rotate_if_due().unwrap().is_some());
        assert_eq!(vault.prune_retired().unwrap(), 0);

        fx.clock.advance(Duration::from_secs(3601));
        assert_eq!(vault.prune_retired().unwrap(), 1);
    }

    #[test]
    fn test_verify_log_detects_tampering() {
        let fx = Fixture::new();
        let vault = fx.start();
        vault.append(LogLevel::Info, "operator note").unwrap();

        fx.log_store.tamper(|entries| entries[1].message.push('!'));
        assert!(!vault.verify_log().unwrap());
        let last = fx.log_store.load_all().unwrap().pop().unwrap();
        assert_eq!(last.level, LogLevel::Critical);
    }

    #[test]
    fn test_failsafe_through_coordinator() {
        let fx = Fixture::new();
        let vault = fx.start();

        assert_eq!(
            vault.arm(&FactorSet::from([AuthFactor::Pin])).unwrap(),
            FailsafeState::Arming
        );
        assert_eq!(vault.arm(&arming_factors()).unwrap(), FailsafeState::Armed);

        fx.clock.advance(Duration::from_secs(30));
        vault.heartbeat().unwrap();
        fx.clock.advance(Duration::from_secs(60));
        assert_eq!(vault.tick(), FailsafeState::Armed);

        fx.clock.advance(Duration::from_secs(1));
        assert_eq!(vault.tick(), FailsafeState::Triggered);
        assert_eq!(vault.tick(), FailsafeState::Triggered);

        assert_eq!(fx.action.calls(), 1);
        assert_eq!(fx.terminator.codes(), vec![EMERGENCY_EXIT_CODE]);
        assert!(vault.status().shut_down);
        assert!(matches!(
            vault.sign(b"late"),
            Err(VaultError::Key(KeyError::Wiped))
        ));
        assert!(matches!(
            vault.heartbeat(),
            Err(VaultError::Failsafe(FailsafeError::Triggered))
        ));
    }

    #[test]
    fn test_shutdown_runs_once() {
        let fx = Fixture::new();
        let vault = fx.start();
        let register_before = fx.root.read_register(SHUTDOWN_REGISTER).unwrap();

        assert!(vault.shutdown("maintenance"));
        assert!(!vault.shutdown("again"));

        assert_eq!(fx.terminator.codes(), vec![0]);
        assert_ne!(
            fx.root.read_register(SHUTDOWN_REGISTER).unwrap(),
            register_before
        );
        assert!(fx
            .messages()
            .last()
            .unwrap()
            .contains("maintenance"));
    }
}
