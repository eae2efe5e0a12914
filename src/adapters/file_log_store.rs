//! Append-only JSON Lines log file

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, warn};

use crate::error::{LogError, StorageError, VaultResult};
use crate::model::LogEntry;
use crate::ports::LogStore;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// One serialized [`LogEntry`] per line, fsynced after every append
///
/// A line only counts once its newline is on disk. A failed append is cut
/// back off the file, and a torn trailing line left by a crash is ignored
/// on load and removed before the next append.
#[derive(Debug)]
pub struct FileLogStore {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileLogStore {
    pub fn open(path: impl Into<PathBuf>) -> VaultResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        Ok(Self {
            path,
            file: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_for_append(&self) -> VaultResult<File> {
        let mut options = OpenOptions::new();
        options.read(true).create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);
        Ok(options
            .open(&self.path)
            .map_err(|e| StorageError::io(&self.path, e))?)
    }
}

impl LogStore for FileLogStore {
    fn append(&self, entry: &LogEntry) -> VaultResult<()> {
        let mut line = serde_json::to_string(entry).map_err(LogError::from)?;
        line.push('\n');

        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        // A handle that failed a write is dropped and reopened next time.
        let mut file = match guard.take() {
            Some(file) => file,
            None => self.open_for_append()?,
        };

        let start = discard_torn_tail(&mut file).map_err(|e| StorageError::io(&self.path, e))?;
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.sync_data()) {
            if let Err(truncate) = file.set_len(start).and_then(|()| file.sync_data()) {
                error!(
                    "Could not remove partial entry {} from {}: {}",
                    entry.sequence_no,
                    self.path.display(),
                    truncate
                );
            }
            return Err(StorageError::io(&self.path, e).into());
        }
        *guard = Some(file);

        debug!("Appended log entry {}", entry.sequence_no);
        Ok(())
    }

    fn load_all(&self) -> VaultResult<Vec<LogEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&self.path, e).into()),
        };

        let complete = content.rfind('\n').map_or(0, |i| i + 1);
        if !content[complete..].trim().is_empty() {
            warn!(
                "Ignoring torn trailing line in {} ({} bytes)",
                self.path.display(),
                content.len() - complete
            );
        }

        let mut entries = Vec::new();
        for (index, line) in content[..complete].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogEntry =
                serde_json::from_str(&line).map_err(|e| LogError::Corrupted {
                    sequence_no: index as u64,
                    reason: format!("line {} does not parse: {}", index + 1, e),
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Cut an unterminated trailing line off `file`, returning the clean length
fn discard_torn_tail(file: &mut File) -> io::Result<u64> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    let mut content = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut content)?;
    let clean = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i as u64 + 1);
    warn!("Removing {} byte torn tail from audit log", len - clean);
    file.set_len(clean)?;
    file.sync_data()?;
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract_tests_for;
    use crate::error::VaultError;
    use crate::ports::contract_tests::log_store_contract;
    use tempfile::TempDir;

    struct TempLog {
        store: FileLogStore,
        _dir: TempDir,
    }

    impl LogStore for TempLog {
        fn append(&self, entry: &LogEntry) -> VaultResult<()> {
            self.store.append(entry)
        }

        fn load_all(&self) -> VaultResult<Vec<LogEntry>> {
            self.store.load_all()
        }
    }

    fn temp_log() -> TempLog {
        let dir = TempDir::new().unwrap();
        TempLog {
            store: FileLogStore::open(dir.path().join("audit").join("log.jsonl")).unwrap(),
            _dir: dir,
        }
    }

    contract_tests_for!(
        file_log_store_contract,
        make = temp_log,
        tests = {
            test_empty_store_loads_nothing => log_store_contract::test_empty_store_loads_nothing,
            test_append_preserves_order => log_store_contract::test_append_preserves_order,
            test_message_with_newlines_survives => log_store_contract::test_message_with_newlines_survives,
        }
    );

    #[test]
    fn test_one_line_per_entry() {
        let temp = temp_log();
        let entry: LogEntry = serde_json::from_str(
            r#"{"sequence_no":0,"timestamp":1000,"level":"INFO","message":"a\nb",
               "entry_digest":"0000000000000000000000000000000000000000000000000000000000000000",
               "chain_digest":"1111111111111111111111111111111111111111111111111111111111111111"}"#,
        )
        .unwrap();
        temp.store.append(&entry).unwrap();
        temp.store.append(&entry).unwrap();

        let content = std::fs::read_to_string(temp.store.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    fn entry(sequence_no: u64) -> LogEntry {
        serde_json::from_str(&format!(
            r#"{{"sequence_no":{sequence_no},"timestamp":1000,"level":"INFO","message":"event",
               "entry_digest":"0000000000000000000000000000000000000000000000000000000000000000",
               "chain_digest":"1111111111111111111111111111111111111111111111111111111111111111"}}"#
        ))
        .unwrap()
    }

    fn write_fragment(path: &Path, entry: &LogEntry) {
        let line = serde_json::to_string(entry).unwrap();
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(&line.as_bytes()[..20]).unwrap();
    }

    #[test]
    fn test_torn_tail_is_ignored_on_load() {
        let temp = temp_log();
        temp.store.append(&entry(0)).unwrap();
        write_fragment(temp.store.path(), &entry(1));

        let entries = temp.store.load_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence_no, 0);
    }

    #[test]
    fn test_append_after_torn_tail_keeps_log_readable() {
        let temp = temp_log();
        temp.store.append(&entry(0)).unwrap();
        write_fragment(temp.store.path(), &entry(1));
        temp.store.append(&entry(1)).unwrap();

        let sequence: Vec<u64> = temp
            .store
            .load_all()
            .unwrap()
            .iter()
            .map(|e| e.sequence_no)
            .collect();
        assert_eq!(sequence, vec![0, 1]);

        let reopened = FileLogStore::open(temp.store.path()).unwrap();
        write_fragment(reopened.path(), &entry(2));
        reopened.append(&entry(2)).unwrap();
        assert_eq!(reopened.load_all().unwrap().len(), 3);
    }

    #[test]
    fn test_garbage_line_is_corruption() {
        let temp = temp_log();
        std::fs::write(temp.store.path(), "{not json}\n").unwrap();

        assert!(matches!(
            temp.store.load_all(),
            Err(VaultError::Log(LogError::Corrupted { sequence_no: 0, .. }))
        ));
    }
}
