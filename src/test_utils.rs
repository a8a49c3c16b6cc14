//! Shared fixtures for unit tests.

use crate::domain::models::{GattEndpoint, TargetConfig};
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::service::BluetoothService;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, Link, LinkEvent, TransportEvent,
};
use crate::infrastructure::clock::ManualClock;
use std::sync::{Arc, Mutex};

/// A transport call as seen by [`RecordingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Initialize,
    Scan,
    StopScan,
    Connect(Link),
    Disconnect(Link),
    RequestMtu(Link, u16),
    Subscribe(Link, GattEndpoint),
    Unsubscribe(Link, GattEndpoint),
    Read(Link, GattEndpoint),
    Write(Link, GattEndpoint, Vec<u8>, bool),
}

/// Records every call; clones share the log
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl RecordingTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl BleTransport for RecordingTransport {
    fn initialize(&mut self) {
        self.record(Call::Initialize);
    }

    fn scan_for_peripherals(&mut self, _service_filter: &[String], _allow_duplicates: bool) {
        self.record(Call::Scan);
    }

    fn stop_scan(&mut self) {
        self.record(Call::StopScan);
    }

    fn connect(&mut self, link: &Link) {
        self.record(Call::Connect(link.clone()));
    }

    fn disconnect(&mut self, link: &Link) {
        self.record(Call::Disconnect(link.clone()));
    }

    fn request_mtu(&mut self, link: &Link, size: u16) {
        self.record(Call::RequestMtu(link.clone(), size));
    }

    fn subscribe(&mut self, link: &Link, endpoint: &GattEndpoint) {
        self.record(Call::Subscribe(link.clone(), endpoint.clone()));
    }

    fn unsubscribe(&mut self, link: &Link, endpoint: &GattEndpoint) {
        self.record(Call::Unsubscribe(link.clone(), endpoint.clone()));
    }

    fn read(&mut self, link: &Link, endpoint: &GattEndpoint) {
        self.record(Call::Read(link.clone(), endpoint.clone()));
    }

    fn write(&mut self, link: &Link, endpoint: &GattEndpoint, data: &[u8], with_response: bool) {
        self.record(Call::Write(
            link.clone(),
            endpoint.clone(),
            data.to_vec(),
            with_response,
        ));
    }
}

pub fn robot() -> TargetConfig {
    TargetConfig::new("Robot", "fff0", "fff0", "fff1", "fff2")
}

pub fn service_with(
    targets: Vec<TargetConfig>,
) -> (BluetoothService<RecordingTransport>, RecordingTransport, ManualClock) {
    let transport = RecordingTransport::default();
    let clock = ManualClock::new();
    let mut service = BluetoothService::new(
        transport.clone(),
        ConnectionConfig::default(),
        Arc::new(clock.clone()),
    );
    for target in targets {
        service.add_target(target);
    }
    (service, transport, clock)
}

pub fn discover(service: &mut BluetoothService<RecordingTransport>, address: &str, name: &str) {
    service.handle_event(TransportEvent::DeviceFound {
        address: address.to_string(),
        name: Some(name.to_string()),
        rssi: Some(-55),
    });
}

pub fn last_connect(transport: &RecordingTransport) -> Option<Link> {
    transport.calls().into_iter().rev().find_map(|call| match call {
        Call::Connect(link) => Some(link),
        _ => None,
    })
}

/// Walk `name` through discovery, MTU and subscription. Returns its link.
pub fn connect_fully(
    service: &mut BluetoothService<RecordingTransport>,
    clock: &ManualClock,
    name: &str,
    address: &str,
    advertised: &str,
) -> Link {
    if !service.is_scanning() {
        service.start_scan();
        service.handle_event(TransportEvent::Initialized);
    }
    discover(service, address, advertised);
    service.tick();

    let link = last_connect(service.transport()).expect("no connection attempt");
    assert_eq!(link.address, address);
    let notify = service
        .target_config(name)
        .expect("unknown target")
        .notify
        .clone();

    let send = |service: &mut BluetoothService<RecordingTransport>, event: LinkEvent| {
        service.handle_event(TransportEvent::Link {
            link: link.clone(),
            event,
        })
    };
    send(
        service,
        LinkEvent::ServiceDiscovered {
            service: notify.service.clone(),
            characteristic: notify.characteristic.clone(),
        },
    );
    clock.advance(service.config().mtu_grace_delay);
    service.tick();
    send(service, LinkEvent::MtuChanged(23));
    send(
        service,
        LinkEvent::Subscribed {
            characteristic: notify.characteristic,
        },
    );

    assert!(service.is_device_connected(name));
    link
}
