use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// A GATT service/characteristic pair on a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattEndpoint {
    pub service: String,
    pub characteristic: String,
}

impl GattEndpoint {
    pub fn new(service: impl Into<String>, characteristic: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            characteristic: characteristic.into(),
        }
    }
}

/// Registration record for a device the manager should keep connected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Logical name, matched as a substring of the advertised name
    pub name: String,
    /// Endpoint subscribed to for inbound data
    pub notify: GattEndpoint,
    /// Endpoint used for outbound writes (absent on notify-only sensors)
    #[serde(default)]
    pub write: Option<GattEndpoint>,
}

impl TargetConfig {
    pub fn new(
        name: impl Into<String>,
        service_notify: impl Into<String>,
        service_write: impl Into<String>,
        characteristic_notify: impl Into<String>,
        characteristic_write: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            notify: GattEndpoint::new(service_notify, characteristic_notify),
            write: Some(GattEndpoint::new(service_write, characteristic_write)),
        }
    }

    pub fn notify_only(
        name: impl Into<String>,
        service_notify: impl Into<String>,
        characteristic_notify: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            notify: GattEndpoint::new(service_notify, characteristic_notify),
            write: None,
        }
    }
}

/// Live state of one registered target
#[derive(Debug, Clone)]
pub struct TargetDevice {
    pub config: TargetConfig,
    /// Transport address, known once a scan has matched the device
    pub address: Option<String>,
    pub connected: bool,
    pub connecting: bool,
    pub service_found: bool,
    /// A subscribe call is in flight for the current link
    pub subscribe_requested: bool,
    pub subscribed: bool,
    /// Last payload handed to the data handlers
    pub cache: Option<Vec<u8>>,
    pub connection_started: Option<Instant>,
    /// Generation of the live link attempt, if any
    pub attempt: Option<u64>,
}

impl TargetDevice {
    pub fn new(config: TargetConfig) -> Self {
        Self {
            config,
            address: None,
            connected: false,
            connecting: false,
            service_found: false,
            subscribe_requested: false,
            subscribed: false,
            cache: None,
            connection_started: None,
            attempt: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Neither connected nor in the middle of connecting
    pub fn is_idle(&self) -> bool {
        !self.connected && !self.connecting
    }

    /// Clear everything learned from the current link
    pub fn clear_link(&mut self) {
        self.connected = false;
        self.connecting = false;
        self.service_found = false;
        self.subscribe_requested = false;
        self.subscribed = false;
        self.connection_started = None;
        self.attempt = None;
    }

    /// Back to "registered, not yet discovered"
    pub fn reset_transient(&mut self) {
        self.clear_link();
        self.address = None;
        self.cache = None;
    }

    /// Address and generation of the live attempt
    pub fn link(&self) -> Option<(String, u64)> {
        match (&self.address, self.attempt) {
            (Some(address), Some(generation)) => Some((address.clone(), generation)),
            _ => None,
        }
    }
}

/// Connection classification derived from the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    NotConfigured,
    Pending,
    Discovered,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotConfigured => "not configured",
            Self::Pending => "waiting for discovery",
            Self::Discovered => "discovered",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Where a connection request lands in the pending queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Notifications emitted by the Bluetooth service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    ScanStarted,
    ScanStopped,
    TransportFailed(String),
    DeviceDiscovered { name: String, address: String },
    DeviceConnected(String),
    DeviceDisconnected(String),
    ConnectionTimedOut(String),
    AllDevicesConnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Pending.to_string(),
            "waiting for discovery"
        );
        assert_eq!(ConnectionState::NotConfigured.to_string(), "not configured");
    }

    #[test]
    fn test_reset_transient_clears_link() {
        let mut device = TargetDevice::new(TargetConfig::new("Robot", "fff0", "fff0", "fff1", "fff2"));
        device.address = Some("AA:BB".into());
        device.connected = true;
        device.subscribed = true;
        device.attempt = Some(4);
        device.cache = Some(vec![1, 2]);

        device.reset_transient();

        assert!(device.address.is_none());
        assert!(device.is_idle());
        assert!(!device.subscribed);
        assert!(device.attempt.is_none());
        assert!(device.cache.is_none());
        assert_eq!(device.name(), "Robot");
    }

    #[test]
    fn test_notify_only_has_no_write_endpoint() {
        let config = TargetConfig::notify_only("Myspeedz", "ffe0", "ffe4");
        assert!(config.write.is_none());
        assert_eq!(config.notify, GattEndpoint::new("ffe0", "ffe4"));
    }
}
