//! Orderly and emergency shutdown
//!
//! The sequence runs once per process: record the reason, wipe key
//! material from memory, measure the event into the hardware root, then
//! hand over to the terminator. Each step is best-effort so a broken log or
//! device cannot keep keys resident.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

use crate::adapters::HardwareCapability;
use crate::model::{HashDigest, LogLevel};
use crate::ports::{AuditSink, ShutdownHook, Terminator, SHUTDOWN_REGISTER};

use super::KeyLifecycleManager;

/// Exit code used when the failsafe or a failed startup ends the process
pub const EMERGENCY_EXIT_CODE: i32 = 2;

const SHUTDOWN_DOMAIN: &[u8] = b"sealkeep/shutdown/v1";

/// Measurement extended into the shutdown register
pub fn shutdown_measurement(reason: &str) -> HashDigest {
    let mut hasher = Sha256::new();
    hasher.update(SHUTDOWN_DOMAIN);
    hasher.update(reason.as_bytes());
    HashDigest::new(hasher.finalize().into())
}

/// Collaborators are attached as they come up during startup, so a failure
/// halfway through still shuts down whatever exists.
pub struct ShutdownSequence {
    terminator: Arc<dyn Terminator>,
    audit: OnceLock<Arc<dyn AuditSink>>,
    keys: OnceLock<Arc<KeyLifecycleManager>>,
    hardware: OnceLock<Arc<HardwareCapability>>,
    started: AtomicBool,
}

impl ShutdownSequence {
    pub fn new(terminator: Arc<dyn Terminator>) -> Self {
        Self {
            terminator,
            audit: OnceLock::new(),
            keys: OnceLock::new(),
            hardware: OnceLock::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn attach_audit(&self, audit: Arc<dyn AuditSink>) {
        if self.audit.set(audit).is_err() {
            warn!("Shutdown audit sink already attached");
        }
    }

    pub fn attach_keys(&self, keys: Arc<KeyLifecycleManager>) {
        if self.keys.set(keys).is_err() {
            warn!("Shutdown key manager already attached");
        }
    }

    pub fn attach_hardware(&self, hardware: Arc<HardwareCapability>) {
        if self.hardware.set(hardware).is_err() {
            warn!("Shutdown hardware root already attached");
        }
    }

    pub fn has_run(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Run the sequence; returns `false` if it already ran
    pub fn run(&self, reason: &str, exit_code: i32) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            info!("Shutdown already in progress, ignoring: {}", reason);
            return false;
        }

        if exit_code == 0 {
            info!("Shutting down: {}", reason);
        } else {
            error!("Emergency shutdown: {}", reason);
        }

        if let Some(audit) = self.audit.get() {
            let level = if exit_code == 0 {
                LogLevel::Warning
            } else {
                LogLevel::Critical
            };
            if let Err(e) = audit.record(level, &format!("vault shutdown: {reason}")) {
                error!("Could not record shutdown: {}", e);
            }
        }

        if let Some(keys) = self.keys.get() {
            keys.wipe();
        }

        if let Some(hardware) = self.hardware.get() {
            match hardware.extend(SHUTDOWN_REGISTER, &shutdown_measurement(reason)) {
                Ok(true) => info!("Shutdown measured into register {}", SHUTDOWN_REGISTER),
                Ok(false) => {}
                Err(e) => warn!("Could not measure shutdown: {}", e),
            }
        }

        self.terminator.terminate(exit_code);
        true
    }
}

impl ShutdownHook for ShutdownSequence {
    fn shutdown(&self, reason: &str) {
        self.run(reason, EMERGENCY_EXIT_CODE);
    }
}

impl std::fmt::Debug for ShutdownSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSequence")
            .field("started", &self.has_run())
            .finish_non_exhaustive()
    }
}
