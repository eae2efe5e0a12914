//! In-memory stores for embedding and tests
//!
//! Clones share the same underlying records, which lets a test "restart" a
//! component against the state the previous instance left behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::VaultResult;
use crate::model::LogEntry;
use crate::ports::{KeyRecord, KeyStore, LogStore};

#[derive(Debug, Clone, Default)]
pub struct MemoryKeyStore {
    records: Arc<Mutex<HashMap<KeyRecord, Vec<u8>>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl KeyStore for MemoryKeyStore {
    fn read(&self, record: KeyRecord) -> VaultResult<Option<Vec<u8>>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&record).cloned())
    }

    fn write_atomic(&self, record: KeyRecord, bytes: &[u8]) -> VaultResult<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(record, bytes.to_vec());
        Ok(())
    }

    fn shred(&self) -> VaultResult<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        for bytes in records.values_mut() {
            zeroize::Zeroize::zeroize(bytes);
        }
        records.clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite stored entries in place, bypassing the append-only contract
    pub fn tamper(&self, f: impl FnOnce(&mut Vec<LogEntry>)) {
        f(&mut self.entries.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl LogStore for MemoryLogStore {
    fn append(&self, entry: &LogEntry) -> VaultResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }

    fn load_all(&self) -> VaultResult<Vec<LogEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
