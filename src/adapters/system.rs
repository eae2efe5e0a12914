//! Clocks, process termination and key-store shredding

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

use crate::error::VaultResult;
use crate::model::{duration_millis, Timestamp};
use crate::ports::{Clock, DestructiveAction, KeyStore, Terminator};

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Timestamp::from_millis(duration_millis(elapsed)),
            Err(e) => {
                warn!("System clock is before the Unix epoch: {}", e);
                Timestamp::EPOCH
            }
        }
    }
}

/// Clock that only moves when told to; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.as_millis())),
        }
    }

    pub fn set(&self, at: Timestamp) {
        self.millis.store(at.as_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(duration_millis(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

/// Terminates the process with `std::process::exit`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, code: i32) {
        error!("Terminating process with exit code {}", code);
        std::process::exit(code);
    }
}

/// Destroys key material by shredding every key-store record
pub struct KeyStoreShredder {
    store: Arc<dyn KeyStore>,
}

impl KeyStoreShredder {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }
}

impl DestructiveAction for KeyStoreShredder {
    fn destroy(&self) -> VaultResult<()> {
        warn!("Shredding all persisted key material");
        self.store.shred()
    }
}
