//! Background maintenance threads

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::config::BackgroundConfig;

use super::coordinator::VaultCoordinator;
use super::failsafe::FailsafeState;

/// Longest uninterrupted sleep, bounds how long `stop` waits
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Handle to the failsafe tick, key rotation and integrity scan threads
///
/// Dropping the handle stops and joins them.
pub struct BackgroundTasks {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn spawn(vault: Arc<VaultCoordinator>, config: &BackgroundConfig) -> std::io::Result<Self> {
        let mut tasks = Self {
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(3),
        };

        let tick_vault = vault.clone();
        tasks.spawn_periodic("sealkeep-failsafe", config.failsafe_tick(), move || {
            if tick_vault.tick() == FailsafeState::Triggered {
                return false;
            }
            true
        })?;

        let rotation_vault = vault.clone();
        tasks.spawn_periodic("sealkeep-rotation", config.rotation_check(), move || {
            if let Err(e) = rotation_vault.rotate_if_due() {
                error!("Scheduled key rotation failed: {}", e);
            }
            if let Err(e) = rotation_vault.prune_retired() {
                warn!("Pruning retired keys failed: {}", e);
            }
            true
        })?;

        tasks.spawn_periodic("sealkeep-integrity", config.integrity_scan(), move || {
            match vault.verify_log() {
                Ok(true) => {}
                Ok(false) => error!("Periodic audit log scan found tampering"),
                Err(e) => error!("Periodic audit log scan failed: {}", e),
            }
            true
        })?;

        Ok(tasks)
    }

    /// Run `task` every `period` until stopped or until it returns `false`
    fn spawn_periodic<F>(&mut self, name: &str, period: Duration, mut task: F) -> std::io::Result<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let stop = self.stop.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!("{} started", thread_name);
            while sleep_unless_stopped(&stop, period) {
                if !task() {
                    break;
                }
            }
            debug!("{} stopped", thread_name);
        });

        match handle {
            Ok(handle) => {
                self.handles.push(handle);
                Ok(())
            }
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Signal every thread and wait for them to finish
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Background thread panicked");
            }
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep for `period`; `false` if a stop was requested meanwhile
fn sleep_unless_stopped(stop: &AtomicBool, period: Duration) -> bool {
    let deadline = Instant::now() + period;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fakes::{RecordingAction, RecordingTerminator};
    use crate::adapters::{EmulatedRoot, EntropyPool, ManualClock, MemoryKeyStore, MemoryLogStore};
    use crate::config::VaultConfig;
    use crate::model::{AuthFactor, FactorSet, Timestamp};
    use crate::ports::LogStore;
    use crate::vault::Collaborators;

    fn start(
        clock: &ManualClock,
        action: &RecordingAction,
    ) -> (Arc<VaultCoordinator>, MemoryLogStore) {
        let log_store = MemoryLogStore::new();
        let mut config = VaultConfig::default();
        config.keys.metadata_kdf_iterations = 1_000;
        config.background.failsafe_tick_ms = 10;
        config.background.rotation_check_secs = 1;
        config.background.integrity_scan_secs = 1;

        let vault = VaultCoordinator::start(
            config,
            Collaborators {
                key_store: Arc::new(MemoryKeyStore::new()),
                log_store: Arc::new(log_store.clone()),
                entropy: EntropyPool::system_default(),
                hardware_root: Some(Arc::new(EmulatedRoot::new())),
                destructive: Arc::new(action.clone()),
                terminator: Arc::new(RecordingTerminator::new()),
                clock: Arc::new(clock.clone()),
            },
        )
        .unwrap();
        (Arc::new(vault), log_store)
    }

    #[test]
    fn test_sleep_stops_early() {
        let stop = AtomicBool::new(true);
        let started = Instant::now();
        assert!(!sleep_unless_stopped(&stop, Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_stop_joins_promptly() {
        let clock = ManualClock::new(Timestamp::from_secs(1_700_000_000));
        let (vault, _) = start(&clock, &RecordingAction::new());

        let mut tasks = vault.spawn_background().unwrap();
        let started = Instant::now();
        tasks.stop();

        assert!(tasks.is_stopped());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_tick_thread_fires_failsafe() {
        let clock = ManualClock::new(Timestamp::from_secs(1_700_000_000));
        let action = RecordingAction::new();
        let (vault, _) = start(&clock, &action);
        vault
            .arm(&FactorSet::from([AuthFactor::Pin, AuthFactor::HardwareToken]))
            .unwrap();

        let _tasks = vault.spawn_background().unwrap();
        clock.advance(Duration::from_secs(61));

        let deadline = Instant::now() + Duration::from_secs(5);
        while action.calls() == 0 {
            assert!(Instant::now() < deadline, "failsafe did not fire");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(vault.status().failsafe.state, FailsafeState::Triggered);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(action.calls(), 1);
    }

    #[test]
    fn test_rotation_thread_rotates_due_key() {
        let clock = ManualClock::new(Timestamp::from_secs(1_700_000_000));
        let (vault, log_store) = start(&clock, &RecordingAction::new());
        let first = vault.active_key().unwrap();

        let _tasks = vault.spawn_background().unwrap();
        clock.advance(Duration::from_secs(24 * 60 * 60 + 1));

        let rotation_logged = || {
            log_store
                .load_all()
                .unwrap()
                .iter()
                .any(|e| e.message.starts_with("signing key rotated"))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while !rotation_logged() {
            assert!(Instant::now() < deadline, "key was not rotated");
            thread::sleep(Duration::from_millis(20));
        }
        assert_ne!(vault.active_key().unwrap(), first);
    }
}
