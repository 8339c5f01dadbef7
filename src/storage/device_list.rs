use crate::error_handling::types::StorageError;
use log::{debug, error};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// `:`-joined target ids of the connected devices, rewritten on every change.
pub struct DeviceListFile {
    path: PathBuf,
    entries: Mutex<Vec<String>>,
}

impl DeviceListFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                error!("Failed to create {}: {}", parent.display(), e);
                StorageError::WriteFailed
            })?;
        }
        let entries = match fs::read_to_string(&path) {
            Ok(content) => content
                .trim()
                .split(':')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &[String]) -> Result<(), StorageError> {
        fs::write(&self.path, entries.join(":")).map_err(|e| {
            error!("Failed to write device list {}: {}", self.path.display(), e);
            StorageError::WriteFailed
        })?;
        debug!("Device list now: {:?}", entries);
        Ok(())
    }

    pub fn add(&self, target_id: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if !entries.iter().any(|e| e == target_id) {
            entries.push(target_id.to_string());
        }
        self.persist(&entries)
    }

    pub fn remove(&self, target_id: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|e| e != target_id);
        self.persist(&entries)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.clear();
        self.persist(&entries)
    }

    pub fn contains(&self, target_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|e| e == target_id)
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
