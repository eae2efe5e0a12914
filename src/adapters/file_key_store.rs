//! Directory-backed key store
//!
//! One file per record. Writes go to a temporary file that is fsynced and
//! renamed over the target, then the directory itself is fsynced.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{StorageError, VaultResult};
use crate::ports::{KeyRecord, KeyStore};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

const DIR_MODE: u32 = 0o700;
const RECORD_MODE: u32 = 0o400;
const WRITABLE_MODE: u32 = 0o600;

#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    /// Open (and create if needed) the key directory with owner-only access
    pub fn open(dir: impl Into<PathBuf>) -> VaultResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        set_mode(&dir, DIR_MODE)?;
        debug!("Key store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, record: KeyRecord) -> PathBuf {
        self.dir.join(record.file_name())
    }

    fn temp_path(&self, record: KeyRecord) -> PathBuf {
        self.dir.join(format!(".{}.tmp", record.file_name()))
    }

    fn sync_dir(&self) -> VaultResult<()> {
        File::open(&self.dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| StorageError::io(&self.dir, e))?;
        Ok(())
    }
}

impl KeyStore for FileKeyStore {
    fn read(&self, record: KeyRecord) -> VaultResult<Option<Vec<u8>>> {
        let path = self.path(record);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e).into()),
        }
    }

    fn write_atomic(&self, record: KeyRecord, bytes: &[u8]) -> VaultResult<()> {
        let tmp = self.temp_path(record);
        let path = self.path(record);

        // Leftover from an interrupted write; it is read-only, so it must go
        // before it can be recreated.
        remove_if_exists(&tmp)?;

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(WRITABLE_MODE);

        let mut file = options.open(&tmp).map_err(|e| StorageError::io(&tmp, e))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| StorageError::io(&tmp, e))?;
        drop(file);

        set_mode(&tmp, RECORD_MODE)?;
        fs::rename(&tmp, &path).map_err(|e| StorageError::io(&path, e))?;
        self.sync_dir()?;

        debug!("Wrote {} ({} bytes)", record.file_name(), bytes.len());
        Ok(())
    }

    fn shred(&self) -> VaultResult<()> {
        let mut first_error = None;

        for record in KeyRecord::ALL {
            for path in [self.path(record), self.temp_path(record)] {
                if let Err(e) = shred_file(&path) {
                    warn!("Failed to shred {}: {}", path.display(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        self.sync_dir()?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Overwrite with zeros, fsync, then unlink
fn shred_file(path: &Path) -> VaultResult<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StorageError::io(path, e).into()),
    };

    set_mode(path, WRITABLE_MODE)?;
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| StorageError::io(path, e))?;
    let len = usize::try_from(len).map_err(|_| StorageError::InvalidRecord {
        record: path.display().to_string(),
        reason: "record too large to shred".to_string(),
    })?;
    file.write_all(&vec![0u8; len])
        .map_err(|e| StorageError::io(path, e))?;
    file.sync_all().map_err(|e| StorageError::io(path, e))?;
    drop(file);

    fs::remove_file(path).map_err(|e| StorageError::io(path, e))?;
    debug!("Shredded {}", path.display());
    Ok(())
}

fn remove_if_exists(path: &Path) -> VaultResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e).into()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> VaultResult<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| StorageError::io(path, e))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> VaultResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract_tests_for;
    use crate::ports::contract_tests::key_store_contract;
    use tempfile::TempDir;

    /// Store plus the directory guard that keeps it alive
    struct TempStore {
        store: FileKeyStore,
        _dir: TempDir,
    }

    impl KeyStore for TempStore {
        fn read(&self, record: KeyRecord) -> VaultResult<Option<Vec<u8>>> {
            self.store.read(record)
        }

        fn write_atomic(&self, record: KeyRecord, bytes: &[u8]) -> VaultResult<()> {
            self.store.write_atomic(record, bytes)
        }

        fn shred(&self) -> VaultResult<()> {
            self.store.shred()
        }
    }

    fn temp_store() -> TempStore {
        let dir = TempDir::new().unwrap();
        TempStore {
            store: FileKeyStore::open(dir.path().join("keys")).unwrap(),
            _dir: dir,
        }
    }

    contract_tests_for!(
        file_key_store_contract,
        make = temp_store,
        tests = {
            test_read_missing_returns_none => key_store_contract::test_read_missing_returns_none,
            test_write_then_read => key_store_contract::test_write_then_read,
            test_overwrite_replaces => key_store_contract::test_overwrite_replaces,
            test_shred_removes_all => key_store_contract::test_shred_removes_all,
        }
    );

    #[cfg(unix)]
    #[test]
    fn test_owner_only_permissions() {
        let temp = temp_store();
        temp.store.write_atomic(KeyRecord::PublicKey, &[1u8; 32]).unwrap();

        let dir_mode = fs::metadata(temp.store.dir()).unwrap().permissions().mode();
        let file_mode = fs::metadata(temp.store.path(KeyRecord::PublicKey))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, DIR_MODE);
        assert_eq!(file_mode & 0o777, RECORD_MODE);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let temp = temp_store();
        temp.store.write_atomic(KeyRecord::Metadata, b"record").unwrap();
        temp.store.write_atomic(KeyRecord::Metadata, b"record 2").unwrap();

        let names: Vec<String> = fs::read_dir(temp.store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["signing.meta".to_string()]);
    }

    #[test]
    fn test_stale_temp_file_is_replaced() {
        let temp = temp_store();
        let stale = temp.store.temp_path(KeyRecord::PublicKey);
        fs::write(&stale, b"partial").unwrap();
        set_mode(&stale, RECORD_MODE).unwrap();

        temp.store.write_atomic(KeyRecord::PublicKey, &[2u8; 32]).unwrap();
        assert_eq!(
            temp.store.read(KeyRecord::PublicKey).unwrap(),
            Some(vec![2u8; 32])
        );
        assert!(!stale.exists());
    }

    #[test]
    fn test_reopen_sees_records() {
        let temp = temp_store();
        temp.store.write_atomic(KeyRecord::SignatureCounter, &9u64.to_be_bytes()).unwrap();

        let reopened = FileKeyStore::open(temp.store.dir()).unwrap();
        assert_eq!(
            reopened.read(KeyRecord::SignatureCounter).unwrap(),
            Some(9u64.to_be_bytes().to_vec())
        );
    }
}
