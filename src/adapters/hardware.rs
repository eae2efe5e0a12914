//! Hardware capability: the one place where hardware presence is decided
//!
//! A present root is driven from a dedicated worker thread and every call is
//! awaited with a timeout, so a wedged device fails the operation instead of
//! blocking the vault. An absent root degrades to pass-through sealing and
//! no-op attestation, with a warning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{HardwareError, VaultError, VaultResult};
use crate::model::{duration_millis, HashDigest, SealedBlob, SecureBuffer};
use crate::ports::HardwareRoot;

type Job = Box<dyn FnOnce(&dyn HardwareRoot) + Send>;

/// Hardware root driven from its own worker thread
pub struct TimedHardware {
    name: String,
    jobs: Mutex<mpsc::Sender<Job>>,
    timeout: Duration,
}

impl TimedHardware {
    pub fn spawn(root: Arc<dyn HardwareRoot>, timeout: Duration) -> VaultResult<Self> {
        let name = root.name().to_string();
        let (tx, rx) = mpsc::channel::<Job>();

        thread::Builder::new()
            .name(format!("hardware-{name}"))
            .spawn(move || {
                for job in rx {
                    job(root.as_ref());
                }
            })
            .map_err(|e| HardwareError::Unavailable {
                reason: format!("failed to start hardware worker: {e}"),
            })?;

        debug!("Hardware worker for '{}' started", name);
        Ok(Self {
            name,
            jobs: Mutex::new(tx),
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn call<T, F>(&self, operation: &'static str, f: F) -> VaultResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn HardwareRoot) -> VaultResult<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move |root| {
            // The caller may have given up waiting; the reply is dropped then.
            let _ = reply_tx.send(f(root));
        });

        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(job)
            .map_err(|_| HardwareError::Unavailable {
                reason: format!("hardware worker for '{}' has stopped", self.name),
            })?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Hardware '{}' did not answer {} within {:?}",
                    self.name, operation, self.timeout
                );
                Err(VaultError::Hardware(HardwareError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: duration_millis(self.timeout),
                }))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(VaultError::Hardware(HardwareError::Unavailable {
                    reason: format!("hardware worker dropped the {operation} request"),
                }))
            }
        }
    }
}

/// Hardware root of trust as seen by the vault
pub enum HardwareCapability {
    Present(TimedHardware),
    Absent {
        /// Set once the degraded-attestation warning has been emitted
        warned: AtomicBool,
    },
}

impl HardwareCapability {
    pub fn present(root: Arc<dyn HardwareRoot>, timeout: Duration) -> VaultResult<Self> {
        Ok(HardwareCapability::Present(TimedHardware::spawn(
            root, timeout,
        )?))
    }

    pub fn absent() -> Self {
        HardwareCapability::Absent {
            warned: AtomicBool::new(false),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, HardwareCapability::Present(_))
    }

    pub fn name(&self) -> &str {
        match self {
            HardwareCapability::Present(hw) => hw.name(),
            HardwareCapability::Absent { .. } => "none",
        }
    }

    /// Seal private key bytes
    ///
    /// Returns the blob and whether it is hardware protected. Without a root
    /// the blob is the plaintext itself.
    pub fn seal(&self, data: &SecureBuffer) -> VaultResult<(SealedBlob, bool)> {
        match self {
            HardwareCapability::Present(hw) => {
                let plaintext = SecureBuffer::from_slice(data.as_slice());
                let blob = hw.call("seal", move |root| root.seal(plaintext.as_slice()))?;
                Ok((SealedBlob::new(blob), true))
            }
            HardwareCapability::Absent { .. } => {
                warn!("No hardware root: key material is stored without hardware sealing");
                Ok((SealedBlob::new(data.as_slice().to_vec()), false))
            }
        }
    }

    /// Recover key bytes sealed by [`seal`](Self::seal)
    pub fn unseal(&self, blob: &SealedBlob, hardware_protected: bool) -> VaultResult<SecureBuffer> {
        if !hardware_protected {
            return Ok(SecureBuffer::from_slice(blob.as_bytes()));
        }
        match self {
            HardwareCapability::Present(hw) => {
                let sealed = blob.clone();
                hw.call("unseal", move |root| root.unseal(sealed.as_bytes()))
            }
            HardwareCapability::Absent { .. } => Err(VaultError::Hardware(
                HardwareError::Unavailable {
                    reason: "material was sealed by a hardware root that is not present"
                        .to_string(),
                },
            )),
        }
    }

    /// Attestation quote over `data`, `None` without a root
    pub fn quote(&self, data: &[u8]) -> VaultResult<Option<Vec<u8>>> {
        match self {
            HardwareCapability::Present(hw) => {
                let data = data.to_vec();
                hw.call("quote", move |root| root.quote(&data)).map(Some)
            }
            HardwareCapability::Absent { warned } => {
                if !warned.swap(true, Ordering::Relaxed) {
                    warn!("No hardware root: log entries will not be attested");
                }
                Ok(None)
            }
        }
    }

    /// Extend a register; returns whether anything was measured
    pub fn extend(&self, register: u32, digest: &HashDigest) -> VaultResult<bool> {
        match self {
            HardwareCapability::Present(hw) => {
                let digest = *digest;
                hw.call("extend", move |root| root.extend(register, &digest))?;
                Ok(true)
            }
            HardwareCapability::Absent { .. } => {
                warn!("No hardware root: register {} not extended", register);
                Ok(false)
            }
        }
    }

    pub fn read_register(&self, register: u32) -> VaultResult<Option<HashDigest>> {
        match self {
            HardwareCapability::Present(hw) => hw
                .call("read_register", move |root| root.read_register(register))
                .map(Some),
            HardwareCapability::Absent { .. } => Ok(None),
        }
    }
}

impl std::fmt::Debug for HardwareCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HardwareCapability::Present(hw) => f
                .debug_struct("Present")
                .field("name", &hw.name)
                .field("timeout", &hw.timeout)
                .finish(),
            HardwareCapability::Absent { .. } => f.write_str("Absent"),
        }
    }
}
