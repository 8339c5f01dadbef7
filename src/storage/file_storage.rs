use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use crate::error_handling::types::StorageError;
use crate::storage::storage_trait::Storage;
use crate::storage::types::{parse_pairs, render_pairs, FactoryRecord, StoredSession, FACTORY_FILE};

/// Directory-per-session storage.
///
/// Layout: `<base_path>/<targetId>/chip_factory.ini`, next to whatever the
/// device process and the DAC tool write into the same directory (key-value
/// store, attestation files). A directory holding fewer than `min_files`
/// regular files never finished its first start.
pub struct FileStorage {
    base_path: PathBuf,
    min_files: usize,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(base_path: P, min_files: usize) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).map_err(|e| {
            error!("Failed to create storage dir {}: {}", base_path.display(), e);
            StorageError::WriteFailed
        })?;
        info!("FileStorage initialized at {}", base_path.display());
        Ok(Self {
            base_path,
            min_files,
        })
    }

    fn record_path(&self, target_id: &str) -> PathBuf {
        self.session_dir(target_id).join(FACTORY_FILE)
    }

    fn read_pairs(&self, target_id: &str) -> Result<Option<BTreeMap<String, String>>, StorageError> {
        let path = self.record_path(target_id);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(parse_pairs(&content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                error!("Failed to read record {}: {}", path.display(), e);
                Err(StorageError::ReadFailed)
            }
        }
    }

    /// Regular files directly inside `dir`; subdirectories do not count.
    fn file_count(dir: &Path) -> usize {
        fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Reads a record without purging the directory on failure.
    fn load_record(&self, target_id: &str) -> Result<FactoryRecord, StorageError> {
        let pairs = self
            .read_pairs(target_id)?
            .ok_or_else(|| StorageError::IncompleteRecord(target_id.to_string()))?;
        FactoryRecord::from_pairs(pairs).map_err(|key| {
            warn!("Record of {} lacks a valid {}", target_id, key);
            StorageError::IncompleteRecord(target_id.to_string())
        })
    }
}

impl Storage for FileStorage {
    fn session_dir(&self, target_id: &str) -> PathBuf {
        self.base_path.join(target_id)
    }

    fn exists(&self, target_id: &str) -> bool {
        self.record_path(target_id).is_file()
    }

    fn create(&self, target_id: &str) -> Result<PathBuf, StorageError> {
        let dir = self.session_dir(target_id);
        fs::create_dir_all(&dir).map_err(|e| {
            error!("Failed to create session dir {}: {}", dir.display(), e);
            StorageError::WriteFailed
        })?;
        debug!("Session dir ready at {}", dir.display());
        Ok(dir)
    }

    fn write_record(&self, target_id: &str, record: &FactoryRecord) -> Result<(), StorageError> {
        let dir = self.create(target_id)?;
        let mut pairs = self.read_pairs(target_id)?.unwrap_or_default();
        pairs.extend(record.to_pairs());

        let path = dir.join(FACTORY_FILE);
        let tmp = dir.join(format!("{}.tmp", FACTORY_FILE));
        fs::write(&tmp, render_pairs(&pairs)).map_err(|e| {
            error!("Failed to write record {}: {}", tmp.display(), e);
            StorageError::WriteFailed
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            error!("Failed to persist record {}: {}", path.display(), e);
            StorageError::WriteFailed
        })?;
        debug!("Saved record of {} to {}", target_id, path.display());
        Ok(())
    }

    fn read_record(&self, target_id: &str) -> Result<Option<FactoryRecord>, StorageError> {
        let Some(pairs) = self.read_pairs(target_id)? else {
            return Ok(None);
        };
        match FactoryRecord::from_pairs(pairs) {
            Ok(record) => Ok(Some(record)),
            Err(key) => {
                warn!(
                    "Record of {} lacks a valid {}, deleting its directory",
                    target_id, key
                );
                self.remove(target_id);
                Ok(None)
            }
        }
    }

    fn remove(&self, target_id: &str) {
        let dir = self.session_dir(target_id);
        if !dir.exists() {
            return;
        }
        match fs::remove_dir_all(&dir) {
            Ok(()) => info!("Removed session dir {}", dir.display()),
            Err(e) => warn!("Failed to remove session dir {}: {}", dir.display(), e),
        }
    }

    fn reconcile_on_boot(&self) -> Result<Vec<StoredSession>, StorageError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| {
            error!("Failed to list storage dir {}: {}", self.base_path.display(), e);
            StorageError::ReadFailed
        })?;

        let mut survivors = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(target_id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };

            let files = Self::file_count(&path);
            if files < self.min_files {
                info!(
                    "Dropping {}: {} file(s), at least {} expected",
                    target_id, files, self.min_files
                );
                self.remove(&target_id);
                continue;
            }

            let record = match self.load_record(&target_id) {
                Ok(r) => r,
                Err(_) => {
                    info!("Dropping {}: incomplete record", target_id);
                    self.remove(&target_id);
                    continue;
                }
            };

            if !record.is_recover {
                info!("Dropping {}: never commissioned", target_id);
                self.remove(&target_id);
                continue;
            }

            if record.device_type.is_empty() || !record.resources().is_complete() {
                info!("Dropping {}: commissioned record without resources", target_id);
                self.remove(&target_id);
                continue;
            }

            survivors.push(StoredSession { target_id, record });
        }

        survivors.sort_by(|a, b| {
            a.record
                .create_time
                .cmp(&b.record.create_time)
                .then_with(|| a.target_id.cmp(&b.target_id))
        });
        info!("{} session(s) to recover", survivors.len());
        Ok(survivors)
    }
}
