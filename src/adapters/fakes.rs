//! Fake collaborators for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{EntropyError, StorageError, VaultError, VaultResult};
use crate::model::{HashDigest, LogEntry, SecureBuffer};
use crate::ports::{
    DestructiveAction, EntropySource, HardwareRoot, LogStore, ShutdownHook, Terminator,
};

use super::{EmulatedRoot, MemoryLogStore};

/// Healthy-looking source whose reads always fail
pub struct BrokenEntropy;

impl EntropySource for BrokenEntropy {
    fn name(&self) -> &str {
        "broken"
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn fill(&self, _buf: &mut [u8]) -> VaultResult<()> {
        Err(VaultError::Entropy(EntropyError::Unavailable {
            attempted: vec!["broken".to_string()],
        }))
    }
}

/// Source that only ever produces one byte value
pub struct StuckEntropy;

impl EntropySource for StuckEntropy {
    fn name(&self) -> &str {
        "stuck"
    }

    fn is_healthy(&self) -> bool {
        false
    }

    fn fill(&self, buf: &mut [u8]) -> VaultResult<()> {
        buf.fill(0x42);
        Ok(())
    }
}

/// Emulated root that sleeps before answering quotes and extends
pub struct StallingRoot {
    inner: EmulatedRoot,
    delay: Duration,
}

impl StallingRoot {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: EmulatedRoot::new(),
            delay,
        }
    }
}

impl HardwareRoot for StallingRoot {
    fn name(&self) -> &str {
        "stalling"
    }

    fn seal(&self, data: &[u8]) -> VaultResult<Vec<u8>> {
        self.inner.seal(data)
    }

    fn unseal(&self, blob: &[u8]) -> VaultResult<SecureBuffer> {
        self.inner.unseal(blob)
    }

    fn quote(&self, data: &[u8]) -> VaultResult<Vec<u8>> {
        std::thread::sleep(self.delay);
        self.inner.quote(data)
    }

    fn extend(&self, register: u32, digest: &HashDigest) -> VaultResult<()> {
        std::thread::sleep(self.delay);
        self.inner.extend(register, digest)
    }

    fn read_register(&self, register: u32) -> VaultResult<HashDigest> {
        self.inner.read_register(register)
    }
}

/// Memory log store that can be switched to fail every append
#[derive(Clone, Default)]
pub struct FailingLogStore {
    pub inner: MemoryLogStore,
    failing: Arc<AtomicBool>,
}

impl FailingLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl LogStore for FailingLogStore {
    fn append(&self, entry: &LogEntry) -> VaultResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(VaultError::Storage(StorageError::io(
                "audit.jsonl",
                std::io::Error::other("disk full"),
            )));
        }
        self.inner.append(entry)
    }

    fn load_all(&self) -> VaultResult<Vec<LogEntry>> {
        self.inner.load_all()
    }
}

/// Counts destroy calls, optionally failing them
#[derive(Clone, Default)]
pub struct RecordingAction {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl RecordingAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            calls: Arc::default(),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DestructiveAction for RecordingAction {
    fn destroy(&self) -> VaultResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(VaultError::Storage(StorageError::InvalidRecord {
                record: "device".to_string(),
                reason: "erase command rejected".to_string(),
            }));
        }
        Ok(())
    }
}

/// Records exit codes instead of exiting
#[derive(Clone, Default)]
pub struct RecordingTerminator {
    codes: Arc<Mutex<Vec<i32>>>,
}

impl RecordingTerminator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().unwrap().clone()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, code: i32) {
        self.codes.lock().unwrap().push(code);
    }
}

/// Records shutdown reasons
#[derive(Clone, Default)]
pub struct RecordingShutdown {
    reasons: Arc<Mutex<Vec<String>>>,
}

impl RecordingShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().unwrap().clone()
    }
}

impl ShutdownHook for RecordingShutdown {
    fn shutdown(&self, reason: &str) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}
