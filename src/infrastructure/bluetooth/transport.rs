//! BLE Transport Contract
//!
//! The native stack is driven through [`BleTransport`]. Calls return
//! immediately; completions come back as [`TransportEvent`] values on the
//! channel the transport was built with.

use crate::domain::models::GattEndpoint;
use std::fmt;

/// One connection attempt to one peripheral.
///
/// Every link-scoped event echoes the link it belongs to, so events from an
/// abandoned attempt can be recognised and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    pub address: String,
    pub generation: u64,
}

impl Link {
    pub fn new(address: impl Into<String>, generation: u64) -> Self {
        Self {
            address: address.into(),
            generation,
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.generation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Initialized,
    InitFailed(String),
    DeviceFound {
        address: String,
        name: Option<String>,
        rssi: Option<i16>,
    },
    Link {
        link: Link,
        event: LinkEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    ServiceDiscovered {
        service: String,
        characteristic: String,
    },
    MtuChanged(u16),
    Subscribed {
        characteristic: String,
    },
    ValueChanged {
        characteristic: String,
        value: Vec<u8>,
    },
    Read {
        characteristic: String,
        value: Vec<u8>,
    },
    Written {
        characteristic: String,
    },
    Disconnected,
}

/// Native BLE operations, fire-and-forget
pub trait BleTransport: Send {
    fn initialize(&mut self);

    fn scan_for_peripherals(&mut self, service_filter: &[String], allow_duplicates: bool);

    fn stop_scan(&mut self);

    fn connect(&mut self, link: &Link);

    fn disconnect(&mut self, link: &Link);

    fn request_mtu(&mut self, link: &Link, size: u16);

    fn subscribe(&mut self, link: &Link, endpoint: &GattEndpoint);

    fn unsubscribe(&mut self, link: &Link, endpoint: &GattEndpoint);

    fn read(&mut self, link: &Link, endpoint: &GattEndpoint);

    fn write(&mut self, link: &Link, endpoint: &GattEndpoint, data: &[u8], with_response: bool);
}
