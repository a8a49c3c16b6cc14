//! Bluetooth Module
//!
//! Keeps a set of named BLE peripherals discovered, connected and
//! subscribed, one connection attempt at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothHandle                       │
//! │  (async API, cloneable, talks to the service task)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ commands
//! ┌─────────────────────▼───────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (registry, pending queue, timers, data handlers)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Protocol │
//! │           │  │            │  │          │
//! │ - Scan    │  │ - Queue    │  │ - UUIDs  │
//! │   session │  │ - GATT     │  │ - Device │
//! │ - Matching│  │   setup    │  │   families│
//! └───────────┘  └────────────┘  └──────────┘
//!                       │
//!                       ▼
//!               ┌───────────────┐
//!               │ BleTransport  │
//!               │ (btleplug or  │
//!               │  simulated)   │
//!               └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Device family identifiers and UUID normalization
//! - [`transport`] - Native transport contract and its events
//! - [`scanner`] - Scan session control and advertisement matching
//! - [`connection`] - Connection state machine, timeouts and reconnects
//! - [`service`] - The service context and its public operations
//! - [`runtime`] - Service task and async handle
//! - [`simulated`] - Scripted in-process transport
//! - `links` - Live link bookkeeping for native backends

pub mod connection;
#[cfg_attr(not(feature = "btleplug"), allow(dead_code))]
pub(crate) mod links;
#[cfg(feature = "btleplug")]
pub mod native;
pub mod protocol;
pub mod runtime;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod transport;

// Re-export main types for convenience
pub use runtime::{spawn_service, BluetoothHandle};
pub use service::BluetoothService;
pub use transport::{BleTransport, Link, LinkEvent, TransportEvent};
