//! Bluetooth Service Module
//!
//! [`BluetoothService`] is the context object that owns the device registry,
//! the pending queue, scan state, timers and data handlers. Every operation
//! takes `&mut self`; nothing here blocks or spawns. The scan controller and
//! the connection state machine live in `scanner.rs` and `connection.rs` as
//! further `impl` blocks on the same type.

use crate::domain::dispatch::{DataDispatcher, DataHandler};
use crate::domain::models::{ConnectionState, Priority, ServiceEvent, TargetConfig};
use crate::domain::queue::PendingQueue;
use crate::domain::registry::DeviceRegistry;
use crate::domain::scheduler::Scheduler;
use crate::domain::settings::Settings;
use crate::error::{BleError, Result};
use crate::infrastructure::bluetooth::connection::{ConnectionConfig, Timer};
use crate::infrastructure::bluetooth::scanner::ScanState;
use crate::infrastructure::bluetooth::transport::{BleTransport, Link, TransportEvent};
use crate::infrastructure::clock::Clock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Multi-device BLE connection manager
pub struct BluetoothService<T: BleTransport> {
    pub(super) transport: T,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: ConnectionConfig,
    pub(super) registry: DeviceRegistry,
    pub(super) queue: PendingQueue,
    pub(super) dispatcher: DataDispatcher,
    pub(super) scan: ScanState,
    pub(super) timers: Scheduler<Timer>,
    pub(super) next_generation: u64,
    pub(super) event_sender: Option<mpsc::UnboundedSender<ServiceEvent>>,
    pub(super) disconnect_waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
}

impl<T: BleTransport> BluetoothService<T> {
    /// Create a new Bluetooth service
    pub fn new(transport: T, config: ConnectionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            config,
            registry: DeviceRegistry::new(),
            queue: PendingQueue::new(),
            dispatcher: DataDispatcher::new(),
            scan: ScanState::default(),
            timers: Scheduler::new(),
            next_generation: 0,
            event_sender: None,
            disconnect_waiters: HashMap::new(),
        }
    }

    /// Build from settings and register the configured startup targets
    pub fn from_settings(transport: T, settings: &Settings, clock: Arc<dyn Clock>) -> Self {
        let mut service = Self::new(transport, ConnectionConfig::from(settings), clock);
        for target in &settings.targets {
            service.add_target(target.clone());
        }
        service
    }

    /// Forward [`ServiceEvent`]s to `sender`
    pub fn with_event_sender(mut self, sender: mpsc::UnboundedSender<ServiceEvent>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(super) fn emit(&self, event: ServiceEvent) {
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(event);
        }
    }

    /// Feed one completion from the transport
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Initialized => self.on_transport_initialized(),
            TransportEvent::InitFailed(reason) => self.on_transport_failed(reason),
            TransportEvent::DeviceFound { address, name, .. } => {
                self.on_device_found(&address, name.as_deref())
            }
            TransportEvent::Link { link, event } => self.handle_link_event(link, event),
        }
    }

    /// Periodic step: due timers, queue, timeouts, scan restart
    pub fn tick(&mut self) {
        let now = self.clock.now();
        for timer in self.timers.take_due(now) {
            self.fire_timer(timer);
        }
        self.pump();
        self.check_timeouts(now);
        self.check_scan_restart(now);
    }

    // ---- Device registry ----

    /// Register a device. No-op if the name is already a target.
    pub fn add_target(&mut self, config: TargetConfig) -> bool {
        let name = config.name.clone();
        let added = self.registry.add(config);
        if added {
            info!("Added target device: {}", name);
        }
        added
    }

    /// Register a device or replace the identifiers of an existing one
    pub fn upsert_target(&mut self, config: TargetConfig) -> bool {
        let name = config.name.clone();
        let added = self.registry.upsert(config);
        if added {
            info!("Added target device: {}", name);
        } else {
            debug!("Updated identifiers for target device: {}", name);
        }
        added
    }

    /// Stop managing a device, disconnecting it first if connected
    pub fn remove_target(&mut self, name: &str) -> bool {
        if !self.registry.contains(name) {
            return false;
        }

        if self.registry.is_connected(name) {
            self.disconnect_device(name);
        }

        self.registry.remove(name);
        self.queue.remove(name);
        self.timers.retain(|timer| timer.device() != name);
        // Its disconnect completion will never be applied
        self.disconnect_waiters.remove(name);

        info!("Removed target device: {}", name);
        true
    }

    pub fn remove_all_targets(&mut self) {
        for name in self.registry.names() {
            self.remove_target(&name);
        }
        self.queue.clear();
    }

    pub fn is_target_device(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn target_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn target_config(&self, name: &str) -> Option<&TargetConfig> {
        self.registry.get(name).map(|d| &d.config)
    }

    pub fn is_device_connected(&self, name: &str) -> bool {
        self.registry.is_connected(name)
    }

    /// Connected device names, in connection order
    pub fn connected_devices(&self) -> Vec<String> {
        self.registry.connected().to_vec()
    }

    pub fn connection_state(&self, name: &str) -> ConnectionState {
        self.registry.state(name)
    }

    /// Human-readable connection state
    pub fn device_status(&self, name: &str) -> String {
        self.connection_state(name).to_string()
    }

    /// Names waiting for a connection attempt, front first
    pub fn pending_devices(&self) -> Vec<String> {
        self.queue.iter().map(str::to_string).collect()
    }

    // ---- Data handlers ----

    pub fn register_data_handler(&mut self, handler: Arc<dyn DataHandler>) -> bool {
        self.dispatcher.register(handler)
    }

    pub fn unregister_data_handler(&mut self, handler: &Arc<dyn DataHandler>) -> bool {
        self.dispatcher.unregister(handler)
    }

    // ---- Sending ----

    /// Write to a connected device's write characteristic
    pub fn send_data_to_device(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        if !self.registry.is_connected(name) {
            warn!("Device {} is not connected, cannot send data", name);
            return Err(BleError::NotConnected(name.to_string()));
        }

        let device = self
            .registry
            .get(name)
            .ok_or_else(|| BleError::UnknownDevice(name.to_string()))?;
        let endpoint = device
            .config
            .write
            .clone()
            .ok_or_else(|| BleError::NoWriteCharacteristic(name.to_string()))?;
        let (address, generation) = device
            .link()
            .ok_or_else(|| BleError::NotConnected(name.to_string()))?;

        debug!("Sending {} bytes to {}", payload.len(), name);
        self.transport
            .write(&Link::new(address, generation), &endpoint, payload, true);
        Ok(())
    }

    /// Write to every connected device. Returns how many writes were issued.
    pub fn broadcast_data(&mut self, payload: &[u8]) -> usize {
        let names = self.registry.connected().to_vec();
        names
            .iter()
            .filter(|name| self.send_data_to_device(name, payload).is_ok())
            .count()
    }

    /// Write if the device is connected right now
    pub fn try_send(&mut self, name: &str, payload: &[u8]) -> Result<bool> {
        if !self.registry.is_connected(name) {
            return Ok(false);
        }
        self.send_data_to_device(name, payload).map(|_| true)
    }

    /// Re-register `name` if needed and put it at the front of the queue
    pub fn request_reconnect(&mut self, name: &str) {
        if !self.registry.contains(name) {
            let config = self
                .registry
                .known_config(name)
                .cloned()
                .unwrap_or_else(|| TargetConfig {
                    name: name.to_string(),
                    ..self.config.heartbeat_fallback.clone()
                });
            info!("Re-registering {} for reconnect", name);
            self.registry.add(config);
        }
        self.connect_device_with_priority(name, Priority::High);
    }
}
