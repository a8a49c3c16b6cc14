//! In-process transport that plays scripted peripherals.
//!
//! Every call is answered immediately on the event channel, the way a well
//! behaved adapter would. Unreachable peripherals never answer a connect,
//! which leaves the attempt to the connection timeout.

use crate::domain::models::GattEndpoint;
use crate::infrastructure::bluetooth::transport::{BleTransport, Link, LinkEvent, TransportEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub address: String,
    pub name: String,
    /// Characteristics reported during service discovery
    pub characteristics: Vec<GattEndpoint>,
    /// Returned by reads of any characteristic
    pub initial_value: Vec<u8>,
    pub reachable: bool,
}

impl SimulatedPeripheral {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            characteristics: Vec::new(),
            initial_value: Vec::new(),
            reachable: true,
        }
    }

    pub fn with_characteristic(mut self, endpoint: GattEndpoint) -> Self {
        self.characteristics.push(endpoint);
        self
    }

    pub fn with_initial_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.initial_value = value.into();
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }
}

#[derive(Debug, Default)]
struct SimState {
    peripherals: Vec<SimulatedPeripheral>,
    init_failure: Option<String>,
    /// Live link per address
    links: HashMap<String, Link>,
    written: Vec<(String, Vec<u8>)>,
}

/// Scripted [`BleTransport`]. Clones share state, so a test can keep one
/// to inject notifications after the service has taken the other.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    pub fn with_peripheral(self, peripheral: SimulatedPeripheral) -> Self {
        self.lock().peripherals.push(peripheral);
        self
    }

    /// Make `initialize` report a failure
    pub fn failing_init(self, reason: impl Into<String>) -> Self {
        self.lock().init_failure = Some(reason.into());
        self
    }

    /// Payloads written so far, with the address they went to
    pub fn written(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().written.clone()
    }

    pub fn is_linked(&self, address: &str) -> bool {
        self.lock().links.contains_key(address)
    }

    /// Push a notification from a linked peripheral
    pub fn notify(&self, address: &str, characteristic: &str, value: &[u8]) -> bool {
        let Some(link) = self.lock().links.get(address).cloned() else {
            return false;
        };
        self.send_link(
            &link,
            LinkEvent::ValueChanged {
                characteristic: characteristic.to_string(),
                value: value.to_vec(),
            },
        );
        true
    }

    /// Drop a link from the peripheral side
    pub fn drop_link(&self, address: &str) -> bool {
        let Some(link) = self.lock().links.remove(address) else {
            return false;
        };
        self.send_link(&link, LinkEvent::Disconnected);
        true
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Simulated transport: event receiver dropped");
        }
    }

    fn send_link(&self, link: &Link, event: LinkEvent) {
        self.send(TransportEvent::Link {
            link: link.clone(),
            event,
        });
    }

    fn peripheral(&self, address: &str) -> Option<SimulatedPeripheral> {
        self.lock()
            .peripherals
            .iter()
            .find(|p| p.address == address)
            .cloned()
    }
}

impl BleTransport for SimulatedTransport {
    fn initialize(&mut self) {
        let failure = self.lock().init_failure.clone();
        match failure {
            Some(reason) => self.send(TransportEvent::InitFailed(reason)),
            None => self.send(TransportEvent::Initialized),
        }
    }

    fn scan_for_peripherals(&mut self, _service_filter: &[String], _allow_duplicates: bool) {
        let peripherals = self.lock().peripherals.clone();
        for peripheral in peripherals {
            self.send(TransportEvent::DeviceFound {
                address: peripheral.address,
                name: Some(peripheral.name),
                rssi: Some(-60),
            });
        }
    }

    fn stop_scan(&mut self) {}

    fn connect(&mut self, link: &Link) {
        let Some(peripheral) = self.peripheral(&link.address) else {
            warn!("Simulated transport: no peripheral at {}", link.address);
            return;
        };
        if !peripheral.reachable {
            return;
        }

        self.lock().links.insert(link.address.clone(), link.clone());
        self.send_link(link, LinkEvent::Connected);
        for endpoint in peripheral.characteristics {
            self.send_link(
                link,
                LinkEvent::ServiceDiscovered {
                    service: endpoint.service,
                    characteristic: endpoint.characteristic,
                },
            );
        }
    }

    fn disconnect(&mut self, link: &Link) {
        let mut state = self.lock();
        if state.links.get(&link.address) == Some(link) {
            state.links.remove(&link.address);
        }
        drop(state);
        self.send_link(link, LinkEvent::Disconnected);
    }

    fn request_mtu(&mut self, link: &Link, size: u16) {
        self.send_link(link, LinkEvent::MtuChanged(size));
    }

    fn subscribe(&mut self, link: &Link, endpoint: &GattEndpoint) {
        self.send_link(
            link,
            LinkEvent::Subscribed {
                characteristic: endpoint.characteristic.clone(),
            },
        );
    }

    fn unsubscribe(&mut self, _link: &Link, _endpoint: &GattEndpoint) {}

    fn read(&mut self, link: &Link, endpoint: &GattEndpoint) {
        let value = self
            .peripheral(&link.address)
            .map(|p| p.initial_value)
            .unwrap_or_default();
        self.send_link(
            link,
            LinkEvent::Read {
                characteristic: endpoint.characteristic.clone(),
                value,
            },
        );
    }

    fn write(&mut self, link: &Link, endpoint: &GattEndpoint, data: &[u8], with_response: bool) {
        self.lock()
            .written
            .push((link.address.clone(), data.to_vec()));
        if with_response {
            self.send_link(
                link,
                LinkEvent::Written {
                    characteristic: endpoint.characteristic.clone(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_reports_characteristics() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = SimulatedTransport::new(tx).with_peripheral(
            SimulatedPeripheral::new("AA:BB", "Robot_X")
                .with_characteristic(GattEndpoint::new("fff0", "fff1")),
        );
        let link = Link::new("AA:BB", 1);

        transport.connect(&link);

        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Link {
                link: link.clone(),
                event: LinkEvent::Connected
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Link {
                link,
                event: LinkEvent::ServiceDiscovered {
                    service: "fff0".into(),
                    characteristic: "fff1".into()
                }
            }
        );
        assert!(transport.is_linked("AA:BB"));
    }

    #[test]
    fn test_unreachable_peripheral_stays_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = SimulatedTransport::new(tx)
            .with_peripheral(SimulatedPeripheral::new("AA:BB", "Robot_X").unreachable());

        transport.connect(&Link::new("AA:BB", 1));

        assert!(rx.try_recv().is_err());
        assert!(!transport.notify("AA:BB", "fff1", &[1]));
    }

    #[test]
    fn test_failing_init() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = SimulatedTransport::new(tx).failing_init("no adapter");
        transport.initialize();
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::InitFailed("no adapter".into())
        );
    }
}
