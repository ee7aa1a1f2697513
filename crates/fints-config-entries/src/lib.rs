//! Config Entries
//!
//! Persists the bank logins created by the setup flow. Each login becomes a
//! [`ConfigEntry`] whose data holds the credentials, the display name, the
//! optional account selection and the system id assigned by the bank.
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single stored bank login
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`ConfigEntries`] - Manager for all config entries
//! - [`FinTsEntryData`] - Typed view of an entry's data
//!
//! # Storage
//!
//! Entries are persisted in `.storage/fints4.config_entries` with version
//! tracking.

pub mod data;
pub mod entry;
pub mod manager;
pub mod storage;

pub use data::{AccountEntry, EntryDataError, FinTsEntryData};
pub use entry::{ConfigEntry, ConfigEntryState};
pub use manager::{
    ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult, STORAGE_KEY,
    STORAGE_VERSION,
};
pub use storage::{Storage, StorageError, StorageFile, StorageResult};
