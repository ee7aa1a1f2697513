//! End-to-end tests: setup flow, entry setup and sensor polling against a
//! scripted bank

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use fints_config_entries::{ConfigEntriesError, ConfigEntry, ConfigEntryState, FinTsEntryData};
use fints_config_flow::{ConfigFlowHandler, FlowResultType, TanPollConfig};
use fints_core::testing::{MockBank, MockBankFactory};
use fints_core::{Amount, Balance, Holding, NeedTanResponse, SepaAccount, TanMechanism, DOMAIN};
use fints_integration::{FinTsIntegration, IntegrationError, IntegrationSettings};
use rust_decimal_macros::dec;
use serde_json::json;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

const GIRO_SENSOR: &str = "sensor.sparkasse_de02120300000000202051";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn settings() -> IntegrationSettings {
    IntegrationSettings {
        scan_interval: Duration::from_secs(3600),
        tan_poll: TanPollConfig {
            interval: Duration::from_millis(5),
            attempts: 3,
            decoupled_delay: Duration::from_millis(1),
        },
    }
}

fn bank() -> MockBank {
    MockBank::new("max")
        .with_account(
            SepaAccount::new(Some("DE02120300000000202051"), "202051", "12030000"),
            Some(1),
        )
        .with_balance(
            "202051",
            Balance {
                amount: Amount {
                    amount: dec!(1234.56),
                    currency: "EUR".to_string(),
                },
                date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            },
        )
        .with_tan_mechanisms(vec![TanMechanism {
            code: "921".to_string(),
            name: "pushTAN".to_string(),
            description_required: false,
        }])
}

fn login() -> serde_json::Value {
    json!({
        "bank_identification_number": "12030000",
        "username": "max",
        "pin": "1234",
        "url": "https://banking.example/fints",
        "name": "Sparkasse",
    })
}

fn entry_data() -> HashMap<String, serde_json::Value> {
    HashMap::from([
        ("bank_identification_number".to_string(), json!("12030000")),
        ("username".to_string(), json!("max")),
        ("pin".to_string(), json!("1234")),
        ("url".to_string(), json!("https://banking.example/fints")),
        ("name".to_string(), json!("Sparkasse")),
    ])
}

async fn wait_for_state(integration: &FinTsIntegration, entity_id: &str) -> Result<String> {
    for _ in 0..500 {
        if let Some(state) = integration.states().get_state(entity_id) {
            return Ok(state);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("{} never got a state", entity_id)
}

// ============================================================================
// Setup flow
// ============================================================================

#[tokio::test]
async fn test_flow_entry_is_set_up_automatically() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let integration = FinTsIntegration::with_settings(
        dir.path(),
        Arc::new(MockBankFactory::new(bank())),
        settings(),
    );
    integration.start().await?;

    let form = integration.flows().start_flow(DOMAIN).await?;
    let result = integration
        .flows()
        .progress_flow(&form.flow_id, Some(login()))
        .await?;
    assert_eq!(result.result_type, FlowResultType::CreateEntry);

    assert_eq!(wait_for_state(&integration, GIRO_SENSOR).await?, "1234.56");
    let state = integration.states().get(GIRO_SENSOR).unwrap();
    assert_eq!(state.attributes["unit_of_measurement"], "EUR");
    assert_eq!(state.attributes["bank"], "Sparkasse");
    assert_eq!(state.attributes["account_type"], "balance");

    let entry_id = result.result.as_ref().unwrap()["entry_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(
        integration.entries().get(&entry_id).unwrap().state,
        ConfigEntryState::Loaded
    );
    Ok(())
}

#[tokio::test]
async fn test_pushtan_flow_end_to_end() -> Result<()> {
    init_tracing();
    let challenge = NeedTanResponse {
        challenge: "Bitte Auftrag in der App freigeben".to_string(),
        decoupled: true,
        reference: "ref-1".to_string(),
    };
    let bank = bank().with_pending_tan(challenge, 1);
    bank.state().system_id_after_tan = Some("sys-42".to_string());

    let dir = TempDir::new()?;
    let integration =
        FinTsIntegration::with_settings(dir.path(), Arc::new(MockBankFactory::new(bank)), settings());
    integration.start().await?;
    let mut progressed = integration.flows().subscribe_progressed();

    let form = integration.flows().start_flow(DOMAIN).await?;
    let progress = integration
        .flows()
        .progress_flow(&form.flow_id, Some(login()))
        .await?;
    assert_eq!(progress.result_type, FlowResultType::ShowProgress);

    let done = tokio::time::timeout(Duration::from_secs(5), progressed.recv()).await??;
    assert_eq!(done.result_type, FlowResultType::ShowProgressDone);

    let result = integration.flows().progress_flow(&form.flow_id, None).await?;
    assert_eq!(result.result_type, FlowResultType::CreateEntry);

    let entry = integration
        .entries()
        .get_by_unique_id(DOMAIN, "12030000-max")
        .unwrap();
    assert_eq!(entry.data["system_id"], "sys-42");
    assert_eq!(wait_for_state(&integration, GIRO_SENSOR).await?, "1234.56");
    Ok(())
}

// ============================================================================
// Entry lifecycle
// ============================================================================

#[tokio::test]
async fn test_stored_entries_are_set_up_on_start() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;

    {
        let first = FinTsIntegration::with_settings(
            dir.path(),
            Arc::new(MockBankFactory::new(bank())),
            settings(),
        );
        first
            .entries()
            .add(ConfigEntry::new(DOMAIN, "Sparkasse").with_data(entry_data()))
            .await?;
    }

    let integration = FinTsIntegration::with_settings(
        dir.path(),
        Arc::new(MockBankFactory::new(bank())),
        settings(),
    );
    integration.start().await?;

    assert_eq!(integration.loaded_entries().len(), 1);
    assert_eq!(wait_for_state(&integration, GIRO_SENSOR).await?, "1234.56");
    Ok(())
}

#[tokio::test]
async fn test_setup_error_is_recorded() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let integration = FinTsIntegration::with_settings(
        dir.path(),
        Arc::new(MockBankFactory::failing()),
        settings(),
    );
    let entry = integration
        .entries()
        .add(ConfigEntry::new(DOMAIN, "Sparkasse").with_data(entry_data()))
        .await?;

    let result = integration.setup_entry(&entry.entry_id).await;

    assert!(matches!(result, Err(IntegrationError::Sensor(_))));
    let stored = integration.entries().get(&entry.entry_id).unwrap();
    assert_eq!(stored.state, ConfigEntryState::SetupError);
    assert!(stored.reason.is_some());
    assert!(integration.states().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unload_and_remove_entry() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let integration = FinTsIntegration::with_settings(
        dir.path(),
        Arc::new(MockBankFactory::new(bank())),
        settings(),
    );
    let entry = integration
        .entries()
        .add(ConfigEntry::new(DOMAIN, "Sparkasse").with_data(entry_data()))
        .await?;

    let entity_ids = integration.setup_entry(&entry.entry_id).await?;
    assert_eq!(entity_ids, [GIRO_SENSOR]);
    wait_for_state(&integration, GIRO_SENSOR).await?;

    let removed = integration.unload_entry(&entry.entry_id).await?;
    assert_eq!(removed, [GIRO_SENSOR]);
    assert!(integration.states().get(GIRO_SENSOR).is_none());
    assert!(integration.loaded_entries().is_empty());
    assert_eq!(
        integration.entries().get(&entry.entry_id).unwrap().state,
        ConfigEntryState::NotLoaded
    );

    integration.remove_entry(&entry.entry_id).await?;
    assert!(integration.entries().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_setup_of_same_entry() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let integration = FinTsIntegration::with_settings(
        dir.path(),
        Arc::new(MockBankFactory::new(bank())),
        settings(),
    );
    let entry = integration
        .entries()
        .add(ConfigEntry::new(DOMAIN, "Sparkasse").with_data(entry_data()))
        .await?;

    let (first, second) = tokio::join!(
        integration.setup_entry(&entry.entry_id),
        integration.setup_entry(&entry.entry_id),
    );

    let (loaded, refused) = match (first, second) {
        (Ok(ids), Err(err)) | (Err(err), Ok(ids)) => (ids, err),
        other => bail!("expected exactly one setup to run: {:?}", other),
    };
    assert_eq!(loaded, [GIRO_SENSOR]);
    assert!(matches!(
        refused,
        IntegrationError::Entries(ConfigEntriesError::Busy(ConfigEntryState::SetupInProgress))
    ));
    assert_eq!(integration.states().entity_ids(), [GIRO_SENSOR]);

    integration.unload_entry(&entry.entry_id).await?;
    assert!(integration.states().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_setup_entry_stores_assigned_system_id() -> Result<()> {
    init_tracing();
    let bank = bank();
    bank.state().system_id = Some("sys-77".to_string());
    let dir = TempDir::new()?;
    let integration =
        FinTsIntegration::with_settings(dir.path(), Arc::new(MockBankFactory::new(bank)), settings());
    let entry = integration
        .entries()
        .add(ConfigEntry::new(DOMAIN, "Sparkasse").with_data(entry_data()))
        .await?;

    integration.setup_entry(&entry.entry_id).await?;

    let stored = integration.entries().get(&entry.entry_id).unwrap();
    assert_eq!(stored.fints_data()?.system_id.as_deref(), Some("sys-77"));
    assert_eq!(stored.state, ConfigEntryState::Loaded);

    let reloaded = FinTsIntegration::new(dir.path(), Arc::new(MockBankFactory::new(MockBank::new("max"))));
    reloaded.load().await?;
    let data = FinTsEntryData::from_data(&reloaded.entries().get(&entry.entry_id).unwrap().data)?;
    assert_eq!(data.system_id.as_deref(), Some("sys-77"));
    assert_eq!(data.pin, "1234");
    Ok(())
}

#[tokio::test]
async fn test_unknown_entry() {
    let dir = TempDir::new().unwrap();
    let integration =
        FinTsIntegration::new(dir.path(), Arc::new(MockBankFactory::new(bank())));

    assert!(matches!(
        integration.setup_entry("missing").await,
        Err(IntegrationError::Entries(_))
    ));
    assert!(integration.unload_entry("missing").await.is_err());
}

// ============================================================================
// YAML platform
// ============================================================================

#[tokio::test]
async fn test_setup_platform_from_yaml() -> Result<()> {
    init_tracing();
    let depot = SepaAccount::new(Some("DE44120300000137075030"), "137075030", "12030000");
    let bank = bank().with_account(depot, Some(30)).with_holdings(
        "137075030",
        vec![Holding {
            isin: "DE0005190003".to_string(),
            name: "BMW".to_string(),
            market_value: dec!(95.50),
            value_symbol: "EUR".to_string(),
            valuation_date: NaiveDate::from_ymd_opt(2024, 5, 17),
            pieces: dec!(10),
            total_value: dec!(955.00),
            acquisition_price: Some(dec!(80)),
        }],
    );

    let dir = TempDir::new()?;
    let integration =
        FinTsIntegration::with_settings(dir.path(), Arc::new(MockBankFactory::new(bank)), settings());

    let yaml: serde_yaml::Value = serde_yaml::from_str(
        r#"
platform: fints4
bank_identification_number: "12030000"
username: max
pin: "1234"
url: https://banking.example/fints
holdings:
  - account: "137075030"
    name: Depot
"#,
    )?;
    let entity_ids = integration.setup_platform(&yaml).await?;

    assert_eq!(
        entity_ids,
        ["sensor.12030000_de02120300000000202051", "sensor.depot"]
    );
    assert_eq!(wait_for_state(&integration, "sensor.depot").await?, "955.00");
    let depot = integration.states().get("sensor.depot").unwrap();
    assert_eq!(depot.attributes["BMW pieces"], json!(10.0));
    Ok(())
}

#[tokio::test]
async fn test_setup_platform_rejects_invalid_yaml() -> Result<()> {
    let dir = TempDir::new()?;
    let integration =
        FinTsIntegration::new(dir.path(), Arc::new(MockBankFactory::new(bank())));

    let yaml: serde_yaml::Value = serde_yaml::from_str("username: max\n")?;
    assert!(matches!(
        integration.setup_platform(&yaml).await,
        Err(IntegrationError::Sensor(_))
    ));
    Ok(())
}
