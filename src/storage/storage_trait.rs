//! Storage Trait
//!
//! This module defines the `Storage` trait, the interface the orchestrator uses
//! to persist per-session factory records.
//!
//! Implementors of this trait are responsible for:
//! - Creating and removing one directory per session, keyed by target id
//! - Persisting and retrieving the factory record of a session
//! - Reconciling what is on disk at boot, returning the sessions to recover
//!
//! Fallible methods return a `Result`; removal is best-effort.

use crate::error_handling::types::StorageError;
use crate::storage::types::{FactoryRecord, StoredSession};
use std::path::PathBuf;

pub trait Storage: Send + Sync {
    /// Directory holding everything of one session, whether it exists or not.
    fn session_dir(&self, target_id: &str) -> PathBuf;

    /// Whether a record file exists for the session.
    fn exists(&self, target_id: &str) -> bool;

    /// Makes the session directory if absent.
    fn create(&self, target_id: &str) -> Result<PathBuf, StorageError>;

    /// Overwrites the record. Keys already on disk that `record` does not set
    /// are kept.
    fn write_record(&self, target_id: &str, record: &FactoryRecord) -> Result<(), StorageError>;

    /// Parses the record. A record missing a required field is treated as
    /// corrupt: its directory is deleted and `None` returned.
    fn read_record(&self, target_id: &str) -> Result<Option<FactoryRecord>, StorageError>;

    /// Deletes the session directory.
    fn remove(&self, target_id: &str);

    /// Purges incomplete and never-commissioned directories and returns the
    /// rest ordered by creation time.
    fn reconcile_on_boot(&self) -> Result<Vec<StoredSession>, StorageError>;
}
