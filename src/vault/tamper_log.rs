//! Hash-chained, signed audit log
//!
//! Each entry commits to its own fields (`entry_digest`) and to the whole
//! history before it (`chain_digest`). The chain digest is signed with the
//! active vault key and, when a hardware root is present, quoted by it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

use crate::adapters::HardwareCapability;
use crate::config::LogConfig;
use crate::error::{LogError, VaultError, VaultResult};
use crate::logic::binding::verify_bound;
use crate::logic::chain::{chain_digest, entry_digest, genesis_digest};
use crate::logic::BoundSignature;
use crate::model::{ArchivedKey, ChainCheckpoint, HashDigest, LogEntry, LogLevel, Timestamp};
use crate::ports::{AuditSink, ChainSigner, Clock, LogStore};

struct LogHead {
    next_sequence_no: u64,
    chain_digest: HashDigest,
    last_timestamp: Timestamp,
    /// Once a signed entry exists, every later non-critical entry must be
    /// signed
    signed_seen: bool,
    signer: Option<Arc<dyn ChainSigner>>,
    attestor: Option<Arc<HardwareCapability>>,
}

impl LogHead {
    fn checkpoint(&self) -> ChainCheckpoint {
        ChainCheckpoint {
            next_sequence_no: self.next_sequence_no,
            chain_digest: self.chain_digest,
        }
    }
}

pub struct TamperEvidentLog {
    store: Arc<dyn LogStore>,
    clock: Arc<dyn Clock>,
    config: LogConfig,
    head: Mutex<LogHead>,
}

impl TamperEvidentLog {
    /// Load the persisted log and resume after its last entry
    ///
    /// # Errors
    ///
    /// Returns `LogError::Corrupted` if the stored entries do not link up
    pub fn open(
        store: Arc<dyn LogStore>,
        clock: Arc<dyn Clock>,
        config: LogConfig,
    ) -> VaultResult<Self> {
        let entries = store.load_all()?;
        let start = genesis_checkpoint();
        let head = replay(&start, &entries, |_| true).map_err(|(sequence_no, reason)| {
            error!("Audit log corrupted at entry {}: {}", sequence_no, reason);
            LogError::Corrupted {
                sequence_no,
                reason,
            }
        })?;

        debug!("Opened audit log with {} entries", entries.len());
        Ok(Self {
            store,
            clock,
            config,
            head: Mutex::new(LogHead {
                next_sequence_no: head.next_sequence_no,
                chain_digest: head.chain_digest,
                last_timestamp: entries.last().map_or(Timestamp::EPOCH, |e| e.timestamp),
                signed_seen: entries.iter().any(|e| e.signature.is_some()),
                signer: None,
                attestor: None,
            }),
        })
    }

    fn head(&self) -> MutexGuard<'_, LogHead> {
        self.head.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sign every entry appended from now on
    pub fn attach_signer(&self, signer: Arc<dyn ChainSigner>) {
        self.head().signer = Some(signer);
        debug!("Audit log signer attached");
    }

    /// Quote every entry appended from now on with the hardware root
    pub fn attach_attestor(&self, hardware: Arc<HardwareCapability>) {
        self.head().attestor = Some(hardware);
    }

    pub fn checkpoint(&self) -> ChainCheckpoint {
        self.head().checkpoint()
    }

    /// Append one entry
    ///
    /// The head only advances once the entry has been stored; on any error
    /// the log is left exactly as it was.
    pub fn append(&self, level: LogLevel, message: &str) -> VaultResult<LogEntry> {
        let mut head = self.head();
        let sequence_no = head.next_sequence_no;
        let timestamp = self.clock.now().max(head.last_timestamp);

        let entry_digest = entry_digest(sequence_no, timestamp, level, message);
        let chain = chain_digest(&head.chain_digest, &entry_digest);

        let signature = match head.signer.as_ref() {
            Some(signer) => Some(signer.sign_digest(chain.as_bytes()).map_err(|e| {
                persist_error(sequence_no, format!("cannot sign chain digest: {e}"))
            })?),
            // A vault that fails to load its key can still record why.
            None if head.signed_seen && level != LogLevel::Critical => {
                return Err(persist_error(
                    sequence_no,
                    "no signer attached after signed entries".to_string(),
                ));
            }
            None => None,
        };

        let attestation = match head.attestor.as_ref() {
            Some(hardware) if self.config.attest_entries => hardware.quote(chain.as_bytes())?,
            _ => None,
        };

        let entry = LogEntry {
            sequence_no,
            timestamp,
            level,
            message: message.to_string(),
            entry_digest,
            chain_digest: chain,
            signature,
            attestation,
        };

        self.store.append(&entry).map_err(|e| {
            error!("Failed to persist audit entry {}: {}", sequence_no, e);
            persist_error(sequence_no, e.to_string())
        })?;

        head.next_sequence_no = sequence_no + 1;
        head.chain_digest = chain;
        head.last_timestamp = timestamp;
        head.signed_seen |= entry.signature.is_some();
        Ok(entry)
    }

    /// Entries as currently persisted
    pub fn entries(&self) -> VaultResult<Vec<LogEntry>> {
        self.store.load_all()
    }

    /// Verify the persisted log and check it still ends at the live head
    ///
    /// Detects truncation of the tail, which a replay alone cannot.
    pub fn verify_persisted(&self, archive: &[ArchivedKey]) -> VaultResult<bool> {
        let head = self.head();
        let entries = self.store.load_all()?;
        let expected = head.checkpoint();
        drop(head);

        if entries.len() as u64 != expected.next_sequence_no {
            warn!(
                "Audit log holds {} entries, expected {}",
                entries.len(),
                expected.next_sequence_no
            );
            return Ok(false);
        }
        let tail_matches = entries
            .last()
            .map_or(genesis_digest(), |e| e.chain_digest)
            == expected.chain_digest;

        Ok(tail_matches && verify_chain(&entries, archive))
    }
}

impl AuditSink for TamperEvidentLog {
    fn record(&self, level: LogLevel, message: &str) -> VaultResult<LogEntry> {
        self.append(level, message)
    }
}

fn persist_error(sequence_no: u64, reason: String) -> VaultError {
    VaultError::Log(LogError::Persist {
        sequence_no,
        reason,
    })
}

fn genesis_checkpoint() -> ChainCheckpoint {
    ChainCheckpoint {
        next_sequence_no: 0,
        chain_digest: genesis_digest(),
    }
}

/// Verify a complete log from genesis
///
/// True iff sequence numbers are consecutive from zero, both digests of
/// every entry recompute, unsigned entries after the first signed one are
/// CRITICAL, and every signature verifies under the archived key of its
/// generation.
pub fn verify_chain(entries: &[LogEntry], archive: &[ArchivedKey]) -> bool {
    verify_chain_from(&genesis_checkpoint(), entries, archive)
}

/// Verify a log segment that continues from a trusted checkpoint
///
/// Signature freshness is not checked: historical entries are expected to
/// be older than any validity window.
pub fn verify_chain_from(
    checkpoint: &ChainCheckpoint,
    entries: &[LogEntry],
    archive: &[ArchivedKey],
) -> bool {
    let result = replay(checkpoint, entries, |entry| {
        signature_valid(entry, archive)
    });
    match result {
        Ok(_) => true,
        Err((sequence_no, reason)) => {
            warn!("Audit chain verification failed at {}: {}", sequence_no, reason);
            false
        }
    }
}

fn signature_valid(entry: &LogEntry, archive: &[ArchivedKey]) -> bool {
    let Some(signature) = entry.signature.as_deref() else {
        return true;
    };
    let Ok(bound) = BoundSignature::from_bytes(signature) else {
        return false;
    };
    if bound.context.key_generation > bound.context.timestamp {
        return false;
    }
    archive
        .iter()
        .find(|k| k.generation_time == bound.context.key_generation)
        .is_some_and(|k| verify_bound(&k.public_key, entry.chain_digest.as_bytes(), &bound))
}

/// Walk the chain, returning the resulting head or `(sequence_no, reason)`
fn replay(
    start: &ChainCheckpoint,
    entries: &[LogEntry],
    mut signature_ok: impl FnMut(&LogEntry) -> bool,
) -> Result<ChainCheckpoint, (u64, String)> {
    let mut expected_sequence = start.next_sequence_no;
    let mut previous = start.chain_digest;
    let mut signed_seen = false;

    for entry in entries {
        let at = entry.sequence_no;
        if entry.sequence_no != expected_sequence {
            return Err((
                at,
                format!("expected sequence number {expected_sequence}"),
            ));
        }

        let recomputed = entry_digest(entry.sequence_no, entry.timestamp, entry.level, &entry.message);
        if recomputed != entry.entry_digest {
            return Err((at, "entry digest mismatch".to_string()));
        }
        if chain_digest(&previous, &recomputed) != entry.chain_digest {
            return Err((at, "chain digest mismatch".to_string()));
        }

        match entry.signature {
            Some(_) => signed_seen = true,
            None if signed_seen && entry.level != LogLevel::Critical => {
                return Err((at, "unsigned entry after signed entries".to_string()));
            }
            None => {}
        }
        if !signature_ok(entry) {
            return Err((at, "signature does not verify".to_string()));
        }

        previous = entry.chain_digest;
        expected_sequence += 1;
    }

    Ok(ChainCheckpoint {
        next_sequence_no: expected_sequence,
        chain_digest: previous,
    })
}
