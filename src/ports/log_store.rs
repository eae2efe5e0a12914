use crate::error::VaultResult;
use crate::model::LogEntry;

/// Append-only storage for log entries
pub trait LogStore: Send + Sync {
    /// Durably append one entry; must not return before the entry is stored
    fn append(&self, entry: &LogEntry) -> VaultResult<()>;

    /// Every stored entry in append order
    fn load_all(&self) -> VaultResult<Vec<LogEntry>>;
}
