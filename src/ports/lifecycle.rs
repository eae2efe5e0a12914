//! Lifecycle capabilities: time, audit, signing of chain digests, and the
//! irreversible actions taken by the failsafe and shutdown.

use crate::error::VaultResult;
use crate::model::{LogEntry, LogLevel, Timestamp};

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Destination for security-relevant events
pub trait AuditSink: Send + Sync {
    fn record(&self, level: LogLevel, message: &str) -> VaultResult<LogEntry>;
}

/// Signs chain digests on behalf of the log
pub trait ChainSigner: Send + Sync {
    fn sign_digest(&self, digest: &[u8]) -> VaultResult<Vec<u8>>;
}

/// Irreversible destruction of key material (device erase, file shredding)
pub trait DestructiveAction: Send + Sync {
    fn destroy(&self) -> VaultResult<()>;
}

/// Ends the process
///
/// Implementations used in production do not return.
pub trait Terminator: Send + Sync {
    fn terminate(&self, code: i32);
}

/// Callback the failsafe uses to shut the vault down
pub trait ShutdownHook: Send + Sync {
    fn shutdown(&self, reason: &str);
}
