//! Sensor setup from YAML or a config entry

use std::sync::Arc;

use fints_client::{run_blocking, FinTsClient};
use fints_config_entries::ConfigEntry;
use fints_core::ClientFactory;
use tracing::{info, instrument};

use crate::config::PlatformConfig;
use crate::entity::{create_entities, SensorEntity};
use crate::error::SensorResult;

/// Sensors created for one bank login
pub struct SensorSetup {
    pub entities: Vec<Arc<dyn SensorEntity>>,
    /// System id the bank used while detecting accounts
    pub system_id: Option<String>,
}

/// Log in to the bank and create a sensor for each account
#[instrument(skip_all, fields(bank = %config.display_name()))]
pub async fn setup_platform(
    config: &PlatformConfig,
    factory: Arc<dyn ClientFactory>,
) -> SensorResult<SensorSetup> {
    setup_client(Arc::new(config.client(factory))).await
}

/// Same as [`setup_platform`], for a login stored by the config flow
#[instrument(skip_all, fields(entry_id = %entry.entry_id))]
pub async fn setup_entry(
    entry: &ConfigEntry,
    factory: Arc<dyn ClientFactory>,
) -> SensorResult<SensorSetup> {
    let data = entry.fints_data()?;
    let client = FinTsClient::new(
        data.credentials(),
        data.display_name(),
        data.account_config(),
        data.holdings_config(),
        factory,
    );
    setup_client(Arc::new(client)).await
}

async fn setup_client(client: Arc<FinTsClient>) -> SensorResult<SensorSetup> {
    let detect = client.clone();
    let detected = run_blocking(move || detect.detect_accounts()).await?;

    let entities = create_entities(
        &client,
        client.name(),
        client.account_config(),
        client.holdings_config(),
        detected.balance,
        detected.holdings,
    );
    info!("Created {} sensors for {}", entities.len(), client.name());
    Ok(SensorSetup {
        entities,
        system_id: client.system_id(),
    })
}
