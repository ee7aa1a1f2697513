//! Data returned by and passed to the FinTS protocol library

use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Everything needed to open a FinTS connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankCredentials {
    /// Bank identification number (BLZ)
    pub blz: String,
    /// Online banking login
    pub login: String,
    /// Online banking PIN
    pub pin: String,
    /// FinTS server URL
    pub url: String,
    /// Registered FinTS product id
    pub product_id: Option<String>,
    /// System id assigned by the bank during a previous synchronisation
    pub system_id: Option<String>,
}

impl BankCredentials {
    pub fn new(
        blz: impl Into<String>,
        login: impl Into<String>,
        pin: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            blz: blz.into(),
            login: login.into(),
            pin: pin.into(),
            url: url.into(),
            product_id: None,
            system_id: None,
        }
    }

    pub fn with_product_id(mut self, product_id: Option<String>) -> Self {
        self.product_id = product_id;
        self
    }

    pub fn with_system_id(mut self, system_id: Option<String>) -> Self {
        self.system_id = system_id;
        self
    }
}

impl fmt::Debug for BankCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BankCredentials")
            .field("blz", &self.blz)
            .field("login", &self.login)
            .field("pin", &"***")
            .field("url", &self.url)
            .field("product_id", &self.product_id)
            .field("system_id", &self.system_id)
            .finish()
    }
}

/// A SEPA account as listed by the bank
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SepaAccount {
    pub iban: Option<String>,
    pub bic: Option<String>,
    pub accountnumber: String,
    pub subaccount: Option<String>,
    pub blz: String,
}

impl SepaAccount {
    pub fn new(iban: Option<&str>, accountnumber: impl Into<String>, blz: impl Into<String>) -> Self {
        Self {
            iban: iban.map(str::to_string),
            bic: None,
            accountnumber: accountnumber.into(),
            subaccount: None,
            blz: blz.into(),
        }
    }
}

/// Per-account details from the bank's information query (UPD)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountInformation {
    pub iban: Option<String>,
    pub account_number: Option<String>,
    /// Account type code; 1-9 are giro/savings, 30-39 are securities
    #[serde(rename = "type")]
    pub account_type: Option<u32>,
    #[serde(default)]
    pub owner_name: Vec<String>,
    pub product_name: Option<String>,
    pub currency: Option<String>,
}

/// Result of the bank information query
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BankInformation {
    #[serde(default)]
    pub accounts: Vec<AccountInformation>,
}

/// A monetary amount in a given currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub amount: Decimal,
    pub currency: String,
}

/// Booked balance of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub amount: Amount,
    pub date: NaiveDate,
}

/// A single position of a securities account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub isin: String,
    pub name: String,
    /// Price of a single piece
    pub market_value: Decimal,
    pub value_symbol: String,
    pub valuation_date: Option<NaiveDate>,
    pub pieces: Decimal,
    pub total_value: Decimal,
    pub acquisition_price: Option<Decimal>,
}

/// A TAN procedure offered by the bank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TanMechanism {
    pub code: String,
    pub name: String,
    /// Whether a TAN medium has to be named when using this mechanism
    pub description_required: bool,
}

/// A registered TAN device (phone, generator, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TanMedium {
    pub name: String,
}

/// A pending TAN challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeedTanResponse {
    /// Text shown to the user
    pub challenge: String,
    /// Confirmation happens out of band (pushTAN app) and no TAN is typed
    pub decoupled: bool,
    /// Task reference the bank uses to match the TAN to the order
    pub reference: String,
}

/// A paused FinTS dialog that can be resumed on the same client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogData(pub Vec<u8>);

/// Outcome of submitting a TAN
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TanOutcome {
    /// The bank accepted the TAN and finished the order
    Completed,
    /// The bank still waits for confirmation
    NeedTan(NeedTanResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_pin() {
        let creds = BankCredentials::new("12030000", "user", "s3cret", "https://bank.example");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("12030000"));
    }

    #[test]
    fn test_account_information_type_field() {
        let info: AccountInformation = serde_json::from_value(serde_json::json!({
            "iban": "DE02120300000000202051",
            "account_number": "202051",
            "type": 30,
            "owner_name": []
        }))
        .unwrap();
        assert_eq!(info.account_type, Some(30));
    }
}
