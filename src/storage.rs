//! Storage subsystem
//!
//! Persistence of per-session state so commissioned devices survive a restart.
//!
//! Components:
//! - `storage_trait`: the Storage trait defining a uniform API.
//! - `types`: the factory record and its file format.
//! - `file_storage`: directory-per-session implementation.
//! - `device_list`: the file listing currently connected devices.

pub mod device_list;
pub mod file_storage;
pub mod storage_trait;
pub mod types;

pub use device_list::DeviceListFile;
pub use file_storage::FileStorage;
pub use storage_trait::Storage;
pub use types::{FactoryRecord, StoredSession};
