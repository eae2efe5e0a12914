//! Entropy adapters and the fallback pool

use rand::rngs::OsRng;
use rand::{RngCore, TryRngCore};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{EntropyError, VaultError, VaultResult};
use crate::model::SecureBuffer;
use crate::ports::EntropySource;

/// Operating-system RNG (`getrandom`)
#[derive(Debug, Clone, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn name(&self) -> &str {
        "os"
    }

    fn is_healthy(&self) -> bool {
        let mut sample = SecureBuffer::new(32);
        if OsRng.try_fill_bytes(sample.as_mut_slice()).is_err() {
            return false;
        }
        passes_repetition_check(sample.as_slice())
    }

    fn fill(&self, buf: &mut [u8]) -> VaultResult<()> {
        OsRng.try_fill_bytes(buf).map_err(|e| {
            warn!("OS entropy read failed: {}", e);
            VaultError::Entropy(EntropyError::Unavailable {
                attempted: vec![self.name().to_string()],
            })
        })
    }
}

/// Userspace CSPRNG seeded from the OS, used as a fallback channel
#[derive(Debug, Clone, Default)]
pub struct ThreadRngEntropy;

impl EntropySource for ThreadRngEntropy {
    fn name(&self) -> &str {
        "thread-rng"
    }

    fn is_healthy(&self) -> bool {
        let mut sample = SecureBuffer::new(32);
        rand::rng().fill_bytes(sample.as_mut_slice());
        passes_repetition_check(sample.as_slice())
    }

    fn fill(&self, buf: &mut [u8]) -> VaultResult<()> {
        rand::rng().fill_bytes(buf);
        Ok(())
    }
}

/// A sample where every byte is identical means a stuck source
fn passes_repetition_check(sample: &[u8]) -> bool {
    match sample.split_first() {
        Some((first, rest)) => rest.iter().any(|b| b != first),
        None => false,
    }
}

/// Primary entropy source plus ordered fallbacks
///
/// `EntropyUnavailable` is only reported once every source has been tried.
#[derive(Clone)]
pub struct EntropyPool {
    sources: Vec<Arc<dyn EntropySource>>,
}

impl EntropyPool {
    pub fn new(primary: Arc<dyn EntropySource>) -> Self {
        Self {
            sources: vec![primary],
        }
    }

    pub fn with_fallback(mut self, source: Arc<dyn EntropySource>) -> Self {
        self.sources.push(source);
        self
    }

    /// OS RNG first, thread RNG as fallback
    pub fn system_default() -> Self {
        Self::new(Arc::new(OsEntropy)).with_fallback(Arc::new(ThreadRngEntropy))
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    /// Fill a fresh secure buffer with `n` random bytes
    ///
    /// # Errors
    ///
    /// Returns `EntropyError::Unavailable` after every source failed
    pub fn get_random(&self, n: usize) -> VaultResult<SecureBuffer> {
        let mut buf = SecureBuffer::new(n);
        self.fill(buf.as_mut_slice())?;
        Ok(buf)
    }

    pub fn fill(&self, buf: &mut [u8]) -> VaultResult<()> {
        let mut attempted = Vec::with_capacity(self.sources.len());

        for (index, source) in self.sources.iter().enumerate() {
            attempted.push(source.name().to_string());

            if !source.is_healthy() {
                warn!("Entropy source '{}' failed its health check", source.name());
                continue;
            }

            match source.fill(buf) {
                Ok(()) => {
                    if index > 0 {
                        warn!("Using fallback entropy source '{}'", source.name());
                    } else {
                        debug!("Drew {} bytes from '{}'", buf.len(), source.name());
                    }
                    return Ok(());
                }
                Err(e) => {
                    zeroize::Zeroize::zeroize(&mut *buf);
                    warn!("Entropy source '{}' failed: {}", source.name(), e);
                }
            }
        }

        Err(VaultError::Entropy(EntropyError::Unavailable { attempted }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fakes::{BrokenEntropy, StuckEntropy};
    use crate::contract_tests_for;
    use crate::ports::contract_tests::entropy_source_contract;

    contract_tests_for!(
        os_entropy_contract,
        make = || OsEntropy,
        tests = {
            test_fill_is_not_constant => entropy_source_contract::test_fill_is_not_constant,
        }
    );

    contract_tests_for!(
        thread_rng_entropy_contract,
        make = || ThreadRngEntropy,
        tests = {
            test_fill_is_not_constant => entropy_source_contract::test_fill_is_not_constant,
        }
    );

    #[test]
    fn test_pool_uses_primary() {
        let pool = EntropyPool::system_default();
        let buf = pool.get_random(32).unwrap();
        assert_eq!(buf.len(), 32);
    }

    #[test]
    fn test_pool_falls_back_on_failure() {
        let pool = EntropyPool::new(Arc::new(BrokenEntropy)).with_fallback(Arc::new(OsEntropy));
        let buf = pool.get_random(16).unwrap();
        assert!(buf.as_slice().iter().any(|b| *b != 0));
    }

    #[test]
    fn test_pool_skips_unhealthy_source() {
        let pool = EntropyPool::new(Arc::new(StuckEntropy)).with_fallback(Arc::new(ThreadRngEntropy));
        let buf = pool.get_random(32).unwrap();
        assert!(passes_repetition_check(buf.as_slice()));
    }

    #[test]
    fn test_pool_exhausted() {
        let pool = EntropyPool::new(Arc::new(BrokenEntropy)).with_fallback(Arc::new(StuckEntropy));
        let err = pool.get_random(32).unwrap_err();
        match err {
            VaultError::Entropy(EntropyError::Unavailable { attempted }) => {
                assert_eq!(attempted, vec!["broken".to_string(), "stuck".to_string()]);
            }
            other => panic!("expected error: {other:?}"),
        }
    }

    #[test]
    fn test_repetition_check() {
        assert!(!passes_repetition_check(&[7u8; 32]));
        assert!(!passes_repetition_check(&[]));
        assert!(passes_repetition_check(&[7, 7, 8]));
    }
}
