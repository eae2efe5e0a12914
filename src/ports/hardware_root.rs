//! HardwareRoot trait - capability to seal, quote and measure

use crate::error::VaultResult;
use crate::model::{HashDigest, SecureBuffer};

/// Register extended with the shutdown event
pub const SHUTDOWN_REGISTER: u32 = 23;

/// Hardware root of trust (TPM-like device)
///
/// Calls may block on device I/O. The vault never calls a root directly: it
/// goes through [`HardwareCapability`](crate::adapters::HardwareCapability),
/// which runs every call on a worker thread with a bounded timeout.
pub trait HardwareRoot: Send + Sync {
    /// Name of the device, for logs
    fn name(&self) -> &str;

    /// Seal `data` so that only this root can unseal it
    ///
    /// # Errors
    ///
    /// Returns `HardwareError::Seal` if the device refuses
    fn seal(&self, data: &[u8]) -> VaultResult<Vec<u8>>;

    /// Reverse [`seal`](Self::seal) into a secure buffer
    ///
    /// # Errors
    ///
    /// Returns `HardwareError::Unseal` if the blob was not sealed by this
    /// root, was tampered with, or the platform state changed
    fn unseal(&self, blob: &[u8]) -> VaultResult<SecureBuffer>;

    /// Produce an attestation quote over `data` and the register state
    fn quote(&self, data: &[u8]) -> VaultResult<Vec<u8>>;

    /// Extend a measurement register with `digest`
    fn extend(&self, register: u32, digest: &HashDigest) -> VaultResult<()>;

    /// Read the current value of a measurement register
    fn read_register(&self, register: u32) -> VaultResult<HashDigest>;
}
