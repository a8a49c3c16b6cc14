//! Multi-device BLE connection manager.
//!
//! Discovers named peripherals, connects them one at a time, subscribes to
//! their notify characteristic and fans inbound data out to registered
//! handlers. Dropped devices are reconnected while a scan is active.

pub mod domain;
pub mod error;
pub mod infrastructure;

#[cfg(test)]
mod test_utils;

pub use domain::dispatch::DataHandler;
pub use domain::models::{ConnectionState, GattEndpoint, Priority, ServiceEvent, TargetConfig};
pub use domain::settings::{Settings, SettingsService};
pub use error::{BleError, Result};
pub use infrastructure::bluetooth::{spawn_service, BluetoothHandle, BluetoothService};
