//! Config entries manager
//!
//! All entries stay in memory. Every change rewrites the whole storage file.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::entry::{ConfigEntry, ConfigEntryState};
use crate::storage::{Storage, StorageError, StorageFile};

pub const STORAGE_KEY: &str = "fints4.config_entries";
pub const STORAGE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("{domain} is already configured for {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Entry is busy: {0:?}")]
    Busy(ConfigEntryState),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// On-disk layout of the entries file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

type UniqueKey = (String, String);

pub struct ConfigEntries {
    storage: Arc<Storage>,
    entries: DashMap<String, ConfigEntry>,
    /// (domain, unique_id) -> entry_id
    unique_ids: DashMap<UniqueKey, String>,
    save_lock: Mutex<()>,
}

impl ConfigEntries {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            unique_ids: DashMap::new(),
            save_lock: Mutex::new(()),
        }
    }

    /// Read the stored entries; a missing file means no entries
    pub async fn load(&self) -> ConfigEntriesResult<()> {
        let Some(data) = self
            .storage
            .load::<ConfigEntriesData>(STORAGE_KEY, STORAGE_VERSION)
            .await?
        else {
            debug!("No stored config entries");
            return Ok(());
        };

        info!("Loading {} config entries", data.entries.len());
        for entry in data.entries {
            self.insert(entry);
        }
        Ok(())
    }

    pub async fn save(&self) -> ConfigEntriesResult<()> {
        let _guard = self.save_lock.lock().await;
        self.write(self.snapshot()).await
    }

    /// All entries, oldest first
    fn snapshot(&self) -> Vec<ConfigEntry> {
        let mut entries: Vec<ConfigEntry> = self.entries.iter().map(|e| e.clone()).collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    /// Write `entries` as the new file content. Caller holds `save_lock`.
    async fn write(&self, entries: Vec<ConfigEntry>) -> ConfigEntriesResult<()> {
        let count = entries.len();
        let file = StorageFile::new(STORAGE_KEY, ConfigEntriesData { entries }, STORAGE_VERSION);
        self.storage.save(&file).await?;
        debug!("Stored {} config entries", count);
        Ok(())
    }

    fn insert(&self, entry: ConfigEntry) {
        if let Some(key) = unique_key(&entry) {
            self.unique_ids.insert(key, entry.entry_id.clone());
        }
        self.entries.insert(entry.entry_id.clone(), entry);
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|e| e.clone())
    }

    /// Entries of a domain, oldest first
    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        let mut entries: Vec<ConfigEntry> = self
            .entries
            .iter()
            .filter(|e| e.domain == domain)
            .map(|e| e.clone())
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        let key = (domain.to_string(), unique_id.to_string());
        let entry_id = self.unique_ids.get(&key)?.clone();
        self.get(&entry_id)
    }

    pub fn is_configured(&self, domain: &str, unique_id: &str) -> bool {
        self.get_by_unique_id(domain, unique_id).is_some()
    }

    /// Store a new entry; a second entry for the same login is rejected
    ///
    /// Memory only changes once the file is written.
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        let _guard = self.save_lock.lock().await;
        if let Some((domain, unique_id)) = unique_key(&entry) {
            if self.is_configured(&domain, &unique_id) {
                return Err(ConfigEntriesError::AlreadyExists { domain, unique_id });
            }
        }

        let mut entries = self.snapshot();
        entries.push(entry.clone());
        self.write(entries).await?;

        self.insert(entry.clone());
        info!("Added {} entry {} [{}]", entry.domain, entry.title, entry.entry_id);
        Ok(entry)
    }

    /// Replace an entry's data, e.g. after the bank assigned a new system id
    pub async fn update_data(
        &self,
        entry_id: &str,
        data: HashMap<String, serde_json::Value>,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let _guard = self.save_lock.lock().await;
        if !self.entries.contains_key(entry_id) {
            return Err(ConfigEntriesError::NotFound(entry_id.to_string()));
        }

        let modified_at = Utc::now();
        let mut entries = self.snapshot();
        for entry in entries.iter_mut().filter(|e| e.entry_id == entry_id) {
            entry.data = data.clone();
            entry.modified_at = modified_at;
        }
        self.write(entries).await?;

        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        entry.data = data;
        entry.modified_at = modified_at;
        debug!("Updated data of {}", entry_id);
        Ok(entry.clone())
    }

    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let _guard = self.save_lock.lock().await;
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        let mut entries = self.snapshot();
        entries.retain(|e| e.entry_id != entry_id);
        self.write(entries).await?;

        self.entries.remove(entry_id);
        if let Some(key) = unique_key(&entry) {
            self.unique_ids.remove(&key);
        }
        info!("Removed {} entry {} [{}]", entry.domain, entry.title, entry_id);
        Ok(entry)
    }

    /// Claim an entry for a setup or unload by moving it to `state`
    ///
    /// Fails with [`ConfigEntriesError::Busy`] while another setup or unload
    /// holds the entry. Check and move happen under the entry's lock.
    pub fn begin_transition(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        if !entry.state.is_recoverable() {
            return Err(ConfigEntriesError::Busy(entry.state));
        }
        debug!("{}: {:?} -> {:?}", entry_id, entry.state, state);
        entry.state = state;
        entry.reason = None;
        Ok(entry.clone())
    }

    /// Runtime state only, nothing is written
    pub fn set_state(&self, entry_id: &str, state: ConfigEntryState, reason: Option<String>) {
        if let Some(mut entry) = self.entries.get_mut(entry_id) {
            debug!("{}: {:?} -> {:?}", entry_id, entry.state, state);
            entry.state = state;
            entry.reason = reason;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unique_key(entry: &ConfigEntry) -> Option<UniqueKey> {
    entry
        .unique_id
        .as_ref()
        .map(|unique_id| (entry.domain.clone(), unique_id.clone()))
}
