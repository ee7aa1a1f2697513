//! Core types for the FinTS integration
//!
//! This crate provides the types shared by every other crate of the
//! integration: bank credentials, SEPA accounts, balances, holdings and TAN
//! challenges, plus the [`BankingClient`] trait that abstracts the FinTS
//! protocol library itself.
//!
//! The protocol library is blocking. Async callers are expected to move calls
//! onto a blocking thread (`tokio::task::spawn_blocking`).

mod bank;
mod error;
mod models;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bank::{BankingClient, ClientFactory};
pub use error::{BankError, BankResult};
pub use models::{
    AccountInformation, Amount, Balance, BankCredentials, BankInformation, DialogData, Holding,
    NeedTanResponse, SepaAccount, TanMechanism, TanMedium, TanOutcome,
};

/// Integration domain
pub const DOMAIN: &str = "fints4";

/// TAN mechanism code for pushTAN (decoupled app confirmation)
pub const PUSHTAN_CODE: &str = "921";

/// Icon used by all sensors
pub const ICON: &str = "mdi:currency-eur";

/// How often sensors are refreshed (4 hours)
pub const SCAN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(4 * 60 * 60);

/// Configuration keys shared by the YAML platform, the config flow and
/// stored config entries
pub mod conf {
    pub const CONF_BIN: &str = "bank_identification_number";
    pub const CONF_USERNAME: &str = "username";
    pub const CONF_PIN: &str = "pin";
    pub const CONF_URL: &str = "url";
    pub const CONF_NAME: &str = "name";
    pub const CONF_PRODUCT_ID: &str = "product_id";
    pub const CONF_ACCOUNTS: &str = "accounts";
    pub const CONF_HOLDINGS: &str = "holdings";
    pub const CONF_ACCOUNT: &str = "account";
    pub const CONF_SYSTEM_ID: &str = "system_id";
}

/// State attribute names
pub mod attrs {
    pub const ATTR_BANK: &str = "bank";
    pub const ATTR_ACCOUNT_TYPE: &str = "account_type";
    pub const ATTR_ACCOUNT: &str = super::conf::CONF_ACCOUNT;
}
