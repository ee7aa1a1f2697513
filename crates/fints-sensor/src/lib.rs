//! FinTS sensors
//!
//! One sensor per bank account: the balance of giro and savings accounts, and
//! the summed market value of securities accounts. Sensors are created from a
//! YAML platform block or a stored config entry and refreshed by a
//! [`SensorPoller`] every [`SCAN_INTERVAL`](fints_core::SCAN_INTERVAL).
//!
//! # Key Types
//!
//! - [`PlatformConfig`] - YAML platform configuration
//! - [`BalanceSensor`] / [`HoldingsSensor`] - The two sensor kinds
//! - [`StateStore`] - Latest sensor states by entity id
//! - [`SensorPoller`] - Background updates

mod config;
mod entity;
mod error;
mod platform;
mod poller;
mod state;

pub use config::PlatformConfig;
pub use entity::{
    create_entities, BalanceSensor, HoldingsSensor, SensorEntity, SensorReading, HOLDINGS_UNIT,
};
pub use error::{SensorError, SensorResult};
pub use platform::{setup_entry, setup_platform, SensorSetup};
pub use poller::{update_entity, SensorPoller};
pub use state::{slugify, SensorState, StateStore, SENSOR_DOMAIN, STATE_UNAVAILABLE};
