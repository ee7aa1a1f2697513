//! Balance and holdings sensors

use std::collections::HashMap;
use std::sync::Arc;

use fints_client::{AccountConfig, FinTsClient};
use fints_core::attrs::{ATTR_ACCOUNT, ATTR_ACCOUNT_TYPE, ATTR_BANK};
use fints_core::{BankResult, SepaAccount, ICON};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, instrument};

/// Unit of the holdings sensor; the bank reports market values in euro
pub const HOLDINGS_UNIT: &str = "EUR";

/// Value read by a sensor update
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub native_value: Decimal,
    pub unit_of_measurement: String,
    pub attributes: HashMap<String, Value>,
}

/// A sensor backed by a bank account
///
/// `update` blocks on bank I/O.
pub trait SensorEntity: Send + Sync {
    fn name(&self) -> &str;

    fn icon(&self) -> &'static str {
        ICON
    }

    /// Fetch the current value from the bank
    fn update(&self) -> BankResult<SensorReading>;
}

fn base_attributes(
    client: &FinTsClient,
    account: String,
    account_type: &str,
) -> HashMap<String, Value> {
    let mut attributes = HashMap::from([
        (ATTR_ACCOUNT.to_string(), Value::String(account)),
        (ATTR_ACCOUNT_TYPE.to_string(), json!(account_type)),
    ]);
    if !client.name().is_empty() {
        attributes.insert(ATTR_BANK.to_string(), json!(client.name()));
    }
    attributes
}

/// Balance of a giro or savings account
pub struct BalanceSensor {
    client: Arc<FinTsClient>,
    account: SepaAccount,
    name: String,
}

impl BalanceSensor {
    pub fn new(client: Arc<FinTsClient>, account: SepaAccount, name: impl Into<String>) -> Self {
        Self {
            client,
            account,
            name: name.into(),
        }
    }

    pub fn account(&self) -> &SepaAccount {
        &self.account
    }
}

impl SensorEntity for BalanceSensor {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(sensor = %self.name))]
    fn update(&self) -> BankResult<SensorReading> {
        let balance = self.client.get_balance(&self.account)?;
        debug!("updated balance of account {}", account_key(&self.account));
        Ok(SensorReading {
            native_value: balance.amount.amount,
            unit_of_measurement: balance.amount.currency,
            attributes: base_attributes(&self.client, account_key(&self.account), "balance"),
        })
    }
}

/// Market value of a securities account
pub struct HoldingsSensor {
    client: Arc<FinTsClient>,
    account: SepaAccount,
    name: String,
}

impl HoldingsSensor {
    pub fn new(client: Arc<FinTsClient>, account: SepaAccount, name: impl Into<String>) -> Self {
        Self {
            client,
            account,
            name: name.into(),
        }
    }

    pub fn account(&self) -> &SepaAccount {
        &self.account
    }
}

impl SensorEntity for HoldingsSensor {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(sensor = %self.name))]
    fn update(&self) -> BankResult<SensorReading> {
        let holdings = self.client.get_holdings(&self.account)?;

        let mut attributes = base_attributes(
            &self.client,
            self.account.accountnumber.clone(),
            "holdings",
        );
        for holding in &holdings {
            attributes.insert(format!("{} total", holding.name), json!(holding.total_value));
            attributes.insert(format!("{} pieces", holding.name), json!(holding.pieces));
            attributes.insert(format!("{} price", holding.name), json!(holding.market_value));
        }

        let total: Decimal = holdings.iter().map(|h| h.total_value).sum();
        debug!("updated {} holdings", holdings.len());
        Ok(SensorReading {
            native_value: total,
            unit_of_measurement: HOLDINGS_UNIT.to_string(),
            attributes,
        })
    }
}

/// IBAN of a balance account, or its account number if it has none
fn account_key(account: &SepaAccount) -> String {
    account
        .iban
        .clone()
        .unwrap_or_else(|| account.accountnumber.clone())
}

/// Create the sensors for the detected accounts
///
/// A non-empty config acts as an allow list: accounts missing from it get no
/// sensor. Configured names win over the generated `"<bank> - <account>"`.
pub fn create_entities(
    client: &Arc<FinTsClient>,
    bank_name: &str,
    account_config: &AccountConfig,
    holdings_config: &AccountConfig,
    balance_accounts: Vec<SepaAccount>,
    holdings_accounts: Vec<SepaAccount>,
) -> Vec<Arc<dyn SensorEntity>> {
    let mut entities: Vec<Arc<dyn SensorEntity>> = Vec::new();

    for account in balance_accounts {
        let key = account_key(&account);
        let Some(name) = sensor_name(bank_name, &key, account_config) else {
            debug!("Skipping account {} for bank {}", key, bank_name);
            continue;
        };
        debug!("Creating account {} for bank {}", key, bank_name);
        entities.push(Arc::new(BalanceSensor::new(client.clone(), account, name)));
    }

    for account in holdings_accounts {
        let key = account.accountnumber.clone();
        let Some(name) = sensor_name(bank_name, &key, holdings_config) else {
            debug!("Skipping holdings {} for bank {}", key, bank_name);
            continue;
        };
        debug!("Creating holdings {} for bank {}", key, bank_name);
        entities.push(Arc::new(HoldingsSensor::new(client.clone(), account, name)));
    }

    entities
}

fn sensor_name(bank_name: &str, key: &str, config: &AccountConfig) -> Option<String> {
    if config.is_empty() {
        return Some(format!("{} - {}", bank_name, key));
    }
    let configured = config.get(key)?;
    Some(
        configured
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{} - {}", bank_name, key)),
    )
}
