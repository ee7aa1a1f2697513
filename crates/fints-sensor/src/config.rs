//! YAML platform configuration
//!
//! ```yaml
//! sensor:
//!   - platform: fints4
//!     bank_identification_number: "12030000"
//!     username: max
//!     pin: !secret fints_pin
//!     url: https://banking.example/fints
//!     accounts:
//!       - account: DE02120300000000202051
//!         name: Giro
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use fints_client::{AccountConfig, FinTsClient};
use fints_config_entries::AccountEntry;
use fints_core::{BankCredentials, ClientFactory};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{SensorError, SensorResult};

/// Configuration of one `fints4` sensor platform
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(rename = "bank_identification_number")]
    pub bin: String,
    pub username: String,
    pub pin: String,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub accounts: Vec<AccountEntry>,
    #[serde(default)]
    pub holdings: Vec<AccountEntry>,
}

impl PlatformConfig {
    /// Parse and validate a platform block
    ///
    /// Keys the platform does not know (such as `platform`) are ignored.
    pub fn from_yaml(yaml: &Value) -> SensorResult<Self> {
        let config: Self = serde_yaml::from_value(yaml.clone())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> SensorResult<Self> {
        let yaml: Value = serde_yaml::from_str(content)?;
        Self::from_yaml(&yaml)
    }

    /// Reject empty required values
    pub fn validate(&self) -> SensorResult<()> {
        let required = [
            ("bank_identification_number", &self.bin),
            ("username", &self.username),
            ("pin", &self.pin),
            ("url", &self.url),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(SensorError::InvalidValue {
                    key: key.to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }

        for (key, entries) in [("accounts", &self.accounts), ("holdings", &self.holdings)] {
            if entries.iter().any(|a| a.account.trim().is_empty()) {
                return Err(SensorError::InvalidValue {
                    key: key.to_string(),
                    reason: "account must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Name of the bank, falling back to the bank identification number
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.bin)
    }

    pub fn credentials(&self) -> BankCredentials {
        BankCredentials::new(&self.bin, &self.username, &self.pin, &self.url)
            .with_product_id(self.product_id.clone())
    }

    /// Balance accounts as IBAN → display name
    pub fn account_config(&self) -> AccountConfig {
        to_config(&self.accounts)
    }

    /// Holdings accounts as account number → display name
    pub fn holdings_config(&self) -> AccountConfig {
        to_config(&self.holdings)
    }

    /// Client for this login; connects on first use
    pub fn client(&self, factory: Arc<dyn ClientFactory>) -> FinTsClient {
        FinTsClient::new(
            self.credentials(),
            self.display_name(),
            self.account_config(),
            self.holdings_config(),
            factory,
        )
    }
}

fn to_config(accounts: &[AccountEntry]) -> AccountConfig {
    accounts
        .iter()
        .map(|a| (a.account.clone(), a.name.clone()))
        .collect::<HashMap<_, _>>()
}

impl std::fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("bin", &self.bin)
            .field("username", &self.username)
            .field("url", &self.url)
            .field("name", &self.name)
            .field("accounts", &self.accounts)
            .field("holdings", &self.holdings)
            .finish_non_exhaustive()
    }
}
