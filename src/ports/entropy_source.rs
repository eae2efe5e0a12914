//! EntropySource trait - capability to supply random bytes

use crate::error::VaultResult;

/// One channel of random bytes
///
/// Sources are combined into an [`EntropyPool`](crate::adapters::EntropyPool)
/// that tries a primary channel first and falls back to the others.
pub trait EntropySource: Send + Sync {
    /// Short name used in logs and in `EntropyUnavailable` errors
    fn name(&self) -> &str;

    /// Health check run before each use
    ///
    /// An unhealthy source is skipped without calling `fill`.
    fn is_healthy(&self) -> bool;

    /// Fill `buf` completely with random bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot deliver; the pool then moves to
    /// the next source.
    fn fill(&self, buf: &mut [u8]) -> VaultResult<()>;
}
