//! FinTS integration
//!
//! Ties the crates together: stored config entries, the setup flow and the
//! sensor pollers. An entry created by a finished flow is set up right away.
//!
//! ```ignore
//! let integration = FinTsIntegration::new(config_dir, factory);
//! integration.start().await?;
//!
//! let form = integration.flows().start_flow(DOMAIN).await?;
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use fints_config_entries::{
    ConfigEntries, ConfigEntriesError, ConfigEntry, ConfigEntryState, Storage,
};
use fints_config_flow::{FinTsConfigFlow, FlowManager, TanPollConfig};
use fints_core::{ClientFactory, DOMAIN, SCAN_INTERVAL};
use fints_sensor::{PlatformConfig, SensorError, SensorPoller, StateStore};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Errors raised while setting up or unloading entries
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error(transparent)]
    Entries(#[from] ConfigEntriesError),

    #[error(transparent)]
    Sensor(#[from] SensorError),
}

pub type IntegrationResult<T> = Result<T, IntegrationError>;

/// Timing knobs, mostly for tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrationSettings {
    pub scan_interval: Duration,
    pub tan_poll: TanPollConfig,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            scan_interval: SCAN_INTERVAL,
            tan_poll: TanPollConfig::default(),
        }
    }
}

/// The running integration
pub struct FinTsIntegration {
    entries: Arc<ConfigEntries>,
    flows: Arc<FlowManager>,
    states: Arc<StateStore>,
    factory: Arc<dyn ClientFactory>,
    settings: IntegrationSettings,
    /// Pollers of config entries, by entry id
    pollers: DashMap<String, SensorPoller>,
    /// Pollers of YAML platforms
    platform_pollers: Mutex<Vec<SensorPoller>>,
    auto_setup: Mutex<Option<JoinHandle<()>>>,
}

impl FinTsIntegration {
    pub fn new(config_dir: impl AsRef<Path>, factory: Arc<dyn ClientFactory>) -> Arc<Self> {
        Self::with_settings(config_dir, factory, IntegrationSettings::default())
    }

    pub fn with_settings(
        config_dir: impl AsRef<Path>,
        factory: Arc<dyn ClientFactory>,
        settings: IntegrationSettings,
    ) -> Arc<Self> {
        let storage = Arc::new(Storage::new(config_dir));
        let entries = Arc::new(ConfigEntries::new(storage));
        let flows = FlowManager::new(entries.clone());
        flows.register(
            DOMAIN,
            FinTsConfigFlow::flow_factory(factory.clone(), settings.tan_poll),
        );

        Arc::new(Self {
            entries,
            flows,
            states: Arc::new(StateStore::new()),
            factory,
            settings,
            pollers: DashMap::new(),
            platform_pollers: Mutex::new(Vec::new()),
            auto_setup: Mutex::new(None),
        })
    }

    pub fn entries(&self) -> &Arc<ConfigEntries> {
        &self.entries
    }

    pub fn flows(&self) -> &Arc<FlowManager> {
        &self.flows
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    /// Load stored entries
    pub async fn load(&self) -> IntegrationResult<()> {
        self.entries.load().await?;
        Ok(())
    }

    /// Load, set up every entry and follow entries created by flows
    pub async fn start(self: &Arc<Self>) -> IntegrationResult<()> {
        self.load().await?;
        self.setup_all().await;
        self.start_auto_setup();
        Ok(())
    }

    fn start_auto_setup(self: &Arc<Self>) {
        let mut created = self.flows.subscribe_created();
        let this: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                match created.recv().await {
                    Ok(entry) if entry.domain == DOMAIN => {
                        let Some(integration) = this.upgrade() else {
                            break;
                        };
                        if let Err(err) = integration.setup_entry(&entry.entry_id).await {
                            warn!("Setup of new entry {} failed: {}", entry.title, err);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} created entries", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let previous = self
            .auto_setup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Create the sensors of an entry and start polling them
    ///
    /// Returns the entity ids of the new sensors. Refused while another
    /// setup or unload of the entry is running.
    #[instrument(skip(self))]
    pub async fn setup_entry(&self, entry_id: &str) -> IntegrationResult<Vec<String>> {
        let entry = self
            .entries
            .begin_transition(entry_id, ConfigEntryState::SetupInProgress)?;

        if let Some((_, poller)) = self.pollers.remove(entry_id) {
            debug!("Replacing running sensors of {}", entry.title);
            poller.stop();
        }

        match fints_sensor::setup_entry(&entry, self.factory.clone()).await {
            Ok(setup) => {
                self.store_system_id(&entry, setup.system_id.as_deref()).await;

                let poller = SensorPoller::start(
                    setup.entities,
                    self.states.clone(),
                    self.settings.scan_interval,
                );
                let entity_ids = poller.entity_ids();
                if let Some(replaced) = self.pollers.insert(entry_id.to_string(), poller) {
                    replaced.stop();
                }
                self.entries
                    .set_state(entry_id, ConfigEntryState::Loaded, None);
                info!("Set up {} with {} sensors", entry.title, entity_ids.len());
                Ok(entity_ids)
            }
            Err(err) => {
                error!("Error setting up {}: {}", entry.title, err);
                self.entries.set_state(
                    entry_id,
                    ConfigEntryState::SetupError,
                    Some(err.to_string()),
                );
                Err(err.into())
            }
        }
    }

    /// Write back a system id the bank assigned after the entry was stored
    async fn store_system_id(&self, entry: &ConfigEntry, system_id: Option<&str>) {
        let Some(system_id) = system_id else {
            return;
        };
        let mut data = match entry.fints_data() {
            Ok(data) => data,
            Err(err) => {
                warn!("Cannot update system id of {}: {}", entry.title, err);
                return;
            }
        };
        if data.system_id.as_deref() == Some(system_id) {
            return;
        }

        data.system_id = Some(system_id.to_string());
        match self.entries.update_data(&entry.entry_id, data.to_data()).await {
            Ok(_) => info!("Stored new system id for {}", entry.title),
            Err(err) => warn!("Could not store system id for {}: {}", entry.title, err),
        }
    }

    /// Set up every stored entry; failures are logged
    ///
    /// Returns the number of entries that loaded.
    pub async fn setup_all(&self) -> usize {
        let mut loaded = 0;
        for entry in self.entries.get_by_domain(DOMAIN) {
            if self.setup_entry(&entry.entry_id).await.is_ok() {
                loaded += 1;
            }
        }
        loaded
    }

    /// Create sensors from a YAML platform block
    pub async fn setup_platform(&self, yaml: &serde_yaml::Value) -> IntegrationResult<Vec<String>> {
        let config = PlatformConfig::from_yaml(yaml)?;
        let setup = fints_sensor::setup_platform(&config, self.factory.clone()).await?;

        let poller = SensorPoller::start(
            setup.entities,
            self.states.clone(),
            self.settings.scan_interval,
        );
        let entity_ids = poller.entity_ids();
        self.platform_pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(poller);
        info!(
            "Set up platform {} with {} sensors",
            config.display_name(),
            entity_ids.len()
        );
        Ok(entity_ids)
    }

    /// Stop polling an entry and drop its sensor states
    ///
    /// Returns the entity ids that were removed.
    #[instrument(skip(self))]
    pub async fn unload_entry(&self, entry_id: &str) -> IntegrationResult<Vec<String>> {
        let entry = self
            .entries
            .begin_transition(entry_id, ConfigEntryState::UnloadInProgress)?;
        let removed = self
            .pollers
            .remove(entry_id)
            .map(|(_, poller)| poller.stop())
            .unwrap_or_default();
        self.entries
            .set_state(entry_id, ConfigEntryState::NotLoaded, None);

        info!("Unloaded {} ({} sensors)", entry.title, removed.len());
        Ok(removed)
    }

    /// Unload an entry and delete it from storage
    pub async fn remove_entry(&self, entry_id: &str) -> IntegrationResult<()> {
        self.unload_entry(entry_id).await?;
        self.entries.remove(entry_id).await?;
        Ok(())
    }

    /// Entry ids with a running poller
    pub fn loaded_entries(&self) -> Vec<String> {
        self.pollers.iter().map(|p| p.key().clone()).collect()
    }
}

impl Drop for FinTsIntegration {
    fn drop(&mut self) {
        let handle = self
            .auto_setup
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
