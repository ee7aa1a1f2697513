//! Login form schema and input validation

use std::collections::HashMap;

use fints_config_entries::FinTsEntryData;
use fints_core::conf::{CONF_BIN, CONF_NAME, CONF_PIN, CONF_PRODUCT_ID, CONF_URL, CONF_USERNAME};
use fints_core::BankCredentials;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::{FlowError, FormField};

/// Fields of the login form as `(key, required)`
const USER_FIELDS: [(&str, bool); 6] = [
    (CONF_BIN, true),
    (CONF_USERNAME, true),
    (CONF_PIN, true),
    (CONF_URL, true),
    (CONF_NAME, false),
    (CONF_PRODUCT_ID, false),
];

/// Build the login form, every field pre-filled from a previous submission
pub fn user_data_schema(previous: Option<&UserInput>) -> Vec<FormField> {
    let defaults = previous.map(UserInput::as_defaults).unwrap_or_default();
    USER_FIELDS
        .iter()
        .map(|(key, required)| {
            FormField::string(*key, *required).with_default(defaults.get(*key).cloned())
        })
        .collect()
}

/// A validated login form submission
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInput {
    #[serde(rename = "bank_identification_number")]
    pub bin: String,
    pub username: String,
    pub pin: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
}

impl UserInput {
    /// Validate a submission against the login schema
    pub fn parse(value: &Value) -> Result<Self, FlowError> {
        let object = value
            .as_object()
            .ok_or_else(|| FlowError::InvalidInput("expected an object".to_string()))?;

        let mut cleaned = serde_json::Map::new();
        for (key, required) in USER_FIELDS {
            match object.get(key) {
                None | Some(Value::Null) if required => {
                    return Err(FlowError::InvalidInput(format!(
                        "required key not provided: {}",
                        key
                    )));
                }
                None | Some(Value::Null) => {}
                Some(Value::String(s)) => {
                    cleaned.insert(key.to_string(), Value::String(s.clone()));
                }
                Some(_) => {
                    return Err(FlowError::InvalidInput(format!(
                        "expected str for dictionary value: {}",
                        key
                    )));
                }
            }
        }

        serde_json::from_value(Value::Object(cleaned))
            .map_err(|e| FlowError::InvalidInput(e.to_string()))
    }

    /// Title of the entry; the bank identification number if no name is set
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.bin)
    }

    /// `<bank identification number>-<username>`
    pub fn unique_id(&self) -> String {
        format!("{}-{}", self.bin, self.username)
    }

    /// Credentials for a first connection (no system id yet)
    pub fn credentials(&self) -> BankCredentials {
        BankCredentials::new(&self.bin, &self.username, &self.pin, &self.url)
            .with_product_id(self.product_id.clone())
    }

    /// Data stored in the created config entry
    pub fn entry_data(&self, system_id: Option<String>) -> FinTsEntryData {
        FinTsEntryData {
            bin: self.bin.clone(),
            username: self.username.clone(),
            pin: self.pin.clone(),
            url: self.url.clone(),
            name: self.name.clone(),
            product_id: self.product_id.clone(),
            system_id,
            accounts: Vec::new(),
            holdings: Vec::new(),
        }
    }

    fn as_defaults(&self) -> HashMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }
}

impl std::fmt::Debug for UserInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserInput")
            .field("bin", &self.bin)
            .field("username", &self.username)
            .field("url", &self.url)
            .field("name", &self.name)
            .field("product_id", &self.product_id)
            .finish_non_exhaustive()
    }
}
