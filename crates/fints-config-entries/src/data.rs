//! Typed view of a FinTS config entry's data

use std::collections::HashMap;
use std::fmt;

use fints_core::BankCredentials;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The entry data does not describe a bank login
#[derive(Debug, Error)]
#[error("invalid config entry data: {0}")]
pub struct EntryDataError(#[from] serde_json::Error);

/// One selected account with an optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    /// IBAN for balance accounts, account number for holdings
    pub account: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Data stored in a FinTS config entry
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinTsEntryData {
    #[serde(rename = "bank_identification_number")]
    pub bin: String,
    pub username: String,
    pub pin: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<AccountEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub holdings: Vec<AccountEntry>,
}

impl FinTsEntryData {
    /// Parse the raw entry data
    pub fn from_data(data: &HashMap<String, serde_json::Value>) -> Result<Self, EntryDataError> {
        let map: serde_json::Map<String, serde_json::Value> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(serde_json::from_value(serde_json::Value::Object(map))?)
    }

    /// Convert back into raw entry data
    pub fn to_data(&self) -> HashMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }

    /// Display name, falling back to the bank identification number
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.bin)
    }

    /// Identifier used to reject a second entry for the same login
    pub fn unique_id(&self) -> String {
        format!("{}-{}", self.bin, self.username)
    }

    /// Credentials including the stored system id
    pub fn credentials(&self) -> BankCredentials {
        BankCredentials::new(&self.bin, &self.username, &self.pin, &self.url)
            .with_product_id(self.product_id.clone())
            .with_system_id(self.system_id.clone())
    }

    /// Selected balance accounts as identifier → display name
    pub fn account_config(&self) -> HashMap<String, Option<String>> {
        to_config(&self.accounts)
    }

    /// Selected holdings accounts as account number → display name
    pub fn holdings_config(&self) -> HashMap<String, Option<String>> {
        to_config(&self.holdings)
    }
}

fn to_config(accounts: &[AccountEntry]) -> HashMap<String, Option<String>> {
    accounts
        .iter()
        .map(|a| (a.account.clone(), a.name.clone()))
        .collect()
}

impl fmt::Debug for FinTsEntryData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinTsEntryData")
            .field("bin", &self.bin)
            .field("username", &self.username)
            .field("url", &self.url)
            .field("name", &self.name)
            .field("system_id", &self.system_id)
            .finish_non_exhaustive()
    }
}
