//! A stored bank login

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::data::{EntryDataError, FinTsEntryData};

/// Where an entry is in its setup/unload cycle
///
/// Only lives in memory; a freshly loaded entry is always `NotLoaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    #[default]
    NotLoaded,
    SetupInProgress,
    /// Sensors exist and are polled
    Loaded,
    SetupError,
    UnloadInProgress,
}

impl ConfigEntryState {
    /// False while a setup or unload is running
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::SetupInProgress | Self::UnloadInProgress)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// ULID
    pub entry_id: String,
    pub domain: String,
    pub title: String,

    /// Raw login data, see [`FinTsEntryData`]
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,

    #[serde(default = "first_version")]
    pub version: u32,

    /// `<bank identification number>-<username>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(skip)]
    pub state: ConfigEntryState,

    /// Why the last setup failed
    #[serde(skip)]
    pub reason: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn first_version() -> u32 {
    1
}

impl ConfigEntry {
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            version: first_version(),
            unique_id: None,
            state: ConfigEntryState::default(),
            reason: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// The login stored in [`data`](Self::data)
    pub fn fints_data(&self) -> Result<FinTsEntryData, EntryDataError> {
        FinTsEntryData::from_data(&self.data)
    }
}
