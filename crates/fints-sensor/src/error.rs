//! Error types for sensor setup

use fints_config_entries::EntryDataError;
use fints_core::BankError;
use thiserror::Error;

/// Result type for sensor operations
pub type SensorResult<T> = Result<T, SensorError>;

/// Errors that can occur while setting up sensors
#[derive(Debug, Error)]
pub enum SensorError {
    /// Failed to parse the platform YAML
    #[error("failed to parse platform config: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// The config entry does not hold a bank login
    #[error(transparent)]
    EntryData(#[from] EntryDataError),

    /// The bank could not be queried
    #[error("bank error: {0}")]
    Bank(#[from] BankError),
}
