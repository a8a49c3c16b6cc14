//! BLE Connection Module
//!
//! Drives one device at a time through connect, service discovery, MTU
//! negotiation and subscription, and handles disconnects and timeouts.

use crate::domain::models::{Priority, ServiceEvent, TargetConfig};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::service::BluetoothService;
use crate::infrastructure::bluetooth::transport::{BleTransport, Link, LinkEvent};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Age after which a scan session is restarted
    pub scan_restart_interval: Duration,
    /// How long a device may stay connecting
    pub connect_timeout: Duration,
    /// Wait before a disconnected device is queued again
    pub reconnect_cooldown: Duration,
    /// Delay between service discovery and the MTU request
    pub mtu_grace_delay: Duration,
    pub mtu_size: u16,
    /// Identifiers for heartbeat targets with no remembered config
    pub heartbeat_fallback: TargetConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ConnectionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            scan_restart_interval: settings.timing.scan_restart_interval(),
            connect_timeout: settings.timing.connect_timeout(),
            reconnect_cooldown: settings.timing.reconnect_cooldown(),
            mtu_grace_delay: settings.timing.mtu_grace_delay(),
            mtu_size: settings.mtu_size,
            heartbeat_fallback: settings.heartbeat_fallback.clone(),
        }
    }
}

/// Deferred connection steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Timer {
    RequestMtu { name: String, link: Link },
    Requeue { name: String },
}

impl Timer {
    pub(crate) fn device(&self) -> &str {
        match self {
            Self::RequestMtu { name, .. } | Self::Requeue { name } => name,
        }
    }
}

impl<T: BleTransport> BluetoothService<T> {
    /// Queue a discovered device. `Priority::High` puts it at the front.
    pub fn connect_device_with_priority(&mut self, name: &str, priority: Priority) -> bool {
        let Some(device) = self.registry.get(name) else {
            warn!("Device {} is not a target, cannot connect", name);
            return false;
        };
        if !device.is_idle() {
            debug!("Device {} is already connected or connecting", name);
            return false;
        }
        if device.address.is_none() {
            debug!("Device {} has not been discovered yet", name);
            return false;
        }

        match priority {
            Priority::High => {
                info!("Prioritizing connection to {}", name);
                self.queue.push_front(name);
            }
            Priority::Normal => {
                self.queue.push_back(name);
            }
        }
        self.pump();
        true
    }

    /// Queue every discovered device that is not connected yet
    pub fn connect_all_pending_devices(&mut self) {
        let ready: Vec<String> = self
            .registry
            .iter()
            .filter(|d| d.is_idle() && d.address.is_some())
            .map(|d| d.name().to_string())
            .collect();

        for name in &ready {
            self.queue.push_back(name);
        }
        self.pump();
    }

    /// Tear down a device's link. Returns false if there is none.
    pub fn disconnect_device(&mut self, name: &str) -> bool {
        let Some(device) = self.registry.get(name) else {
            return false;
        };
        let Some((address, generation)) = device.link() else {
            debug!("Device {} has no active link", name);
            return false;
        };

        info!("Disconnecting from {}", name);
        let link = Link::new(address, generation);
        if device.subscribed {
            self.transport.unsubscribe(&link, &device.config.notify);
        }
        self.transport.disconnect(&link);
        true
    }

    pub fn disconnect_all_devices(&mut self) {
        for name in self.registry.connected().to_vec() {
            self.disconnect_device(&name);
        }
        self.stop_scan();
    }

    /// Resolve `waiter` once `name` has no live link
    pub fn notify_on_disconnect(&mut self, name: &str, waiter: oneshot::Sender<()>) {
        let linked = self
            .registry
            .get(name)
            .map(|d| d.link().is_some())
            .unwrap_or(false);

        if linked {
            self.disconnect_waiters
                .entry(name.to_string())
                .or_default()
                .push(waiter);
        } else {
            let _ = waiter.send(());
        }
    }

    /// Start the next queued connection if nothing is connecting
    pub(super) fn pump(&mut self) {
        while !self.registry.any_connecting() {
            let Some(name) = self.queue.pop_front() else {
                break;
            };

            let admissible = self
                .registry
                .get(&name)
                .map(|d| d.is_idle() && d.address.is_some())
                .unwrap_or(false);
            if !admissible {
                trace!("Dropping stale queue entry {}", name);
                continue;
            }

            self.start_connection(&name);
        }
    }

    fn start_connection(&mut self, name: &str) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let now = self.clock.now();

        let Some(device) = self.registry.get_mut(name) else {
            return;
        };
        let Some(address) = device.address.clone() else {
            return;
        };
        device.connecting = true;
        device.service_found = false;
        device.subscribe_requested = false;
        device.subscribed = false;
        device.connection_started = Some(now);
        device.attempt = Some(generation);

        let link = Link::new(address, generation);
        info!("Connecting to {} ({})", name, link);
        self.transport.connect(&link);
    }

    /// Route a link-scoped completion to its device
    pub(super) fn handle_link_event(&mut self, link: Link, event: LinkEvent) {
        let Some(device) = self.registry.get_by_link_mut(&link.address, link.generation) else {
            trace!("Ignoring {:?} from stale link {}", event, link);
            return;
        };
        let name = device.name().to_string();

        match event {
            LinkEvent::Connected => debug!("Link to {} established", name),
            LinkEvent::ServiceDiscovered {
                service,
                characteristic,
            } => self.on_service_discovered(&name, link, &service, &characteristic),
            LinkEvent::MtuChanged(mtu) => self.on_mtu_changed(&name, &link, mtu),
            LinkEvent::Subscribed { characteristic } => {
                self.on_subscribed(&name, &link, &characteristic)
            }
            LinkEvent::ValueChanged {
                characteristic,
                value,
            }
            | LinkEvent::Read {
                characteristic,
                value,
            } => self.on_value(&name, &characteristic, &value),
            LinkEvent::Written { characteristic } => {
                trace!("Write to {} on {} completed", name, characteristic)
            }
            LinkEvent::Disconnected => self.on_disconnected(&name),
        }
    }

    fn on_service_discovered(
        &mut self,
        name: &str,
        link: Link,
        service: &str,
        characteristic: &str,
    ) {
        let Some(device) = self.registry.get_mut(name) else {
            return;
        };
        if !device.connecting || device.service_found {
            return;
        }
        let notify = &device.config.notify;
        if !protocol::uuid_eq(service, &notify.service)
            || !protocol::uuid_eq(characteristic, &notify.characteristic)
        {
            trace!("{}: skipping {}/{}", name, service, characteristic);
            return;
        }

        debug!("{}: notify characteristic found", name);
        device.service_found = true;
        let due = self.clock.now() + self.config.mtu_grace_delay;
        self.timers.schedule(
            due,
            Timer::RequestMtu {
                name: name.to_string(),
                link,
            },
        );
    }

    pub(super) fn fire_timer(&mut self, timer: Timer) {
        match timer {
            Timer::RequestMtu { name, link } => {
                let Some(device) = self.registry.get(&name) else {
                    return;
                };
                let live = device.attempt == Some(link.generation)
                    && device.address.as_deref() == Some(link.address.as_str());
                if !live || !device.connecting || !device.service_found {
                    return;
                }
                debug!("{}: requesting MTU {}", name, self.config.mtu_size);
                self.transport.request_mtu(&link, self.config.mtu_size);
            }
            Timer::Requeue { name } => {
                if !self.scan.scanning {
                    return;
                }
                let Some(device) = self.registry.get(&name) else {
                    return;
                };
                if device.is_idle() && device.address.is_some() {
                    info!("Re-queueing {} after disconnect", name);
                    self.queue.push_back(&name);
                }
            }
        }
    }

    fn on_mtu_changed(&mut self, name: &str, link: &Link, mtu: u16) {
        let Some(device) = self.registry.get_mut(name) else {
            return;
        };
        debug!("{}: MTU changed to {}", name, mtu);
        if !device.connecting || !device.service_found || device.subscribe_requested {
            return;
        }
        device.subscribe_requested = true;
        self.transport.subscribe(link, &device.config.notify);
    }

    fn on_subscribed(&mut self, name: &str, link: &Link, characteristic: &str) {
        let Some(device) = self.registry.get_mut(name) else {
            return;
        };
        if !device.connecting || !protocol::uuid_eq(characteristic, &device.config.notify.characteristic)
        {
            return;
        }

        device.connected = true;
        device.subscribed = true;
        device.connecting = false;
        device.connection_started = None;
        device.cache = None;
        let notify = device.config.notify.clone();

        self.registry.mark_connected(name);
        info!(
            "Connected to {}, {} device(s) connected",
            name,
            self.registry.connected().len()
        );

        // Seed the cache with the current value
        self.transport.read(link, &notify);
        self.emit(ServiceEvent::DeviceConnected(name.to_string()));

        self.pump();

        if self.registry.all_connected() {
            info!("All target devices connected");
            self.emit(ServiceEvent::AllDevicesConnected);
            self.stop_scan();
        }
    }

    fn on_value(&mut self, name: &str, characteristic: &str, value: &[u8]) {
        let Some(device) = self.registry.get_mut(name) else {
            return;
        };
        if !device.subscribed
            || !protocol::uuid_eq(characteristic, &device.config.notify.characteristic)
        {
            return;
        }
        if !crate::domain::dispatch::accept_payload(&mut device.cache, value) {
            trace!("{}: duplicate payload dropped", name);
            return;
        }
        self.dispatcher.dispatch(name, value);
    }

    fn on_disconnected(&mut self, name: &str) {
        let Some(device) = self.registry.get_mut(name) else {
            return;
        };
        device.clear_link();
        self.registry.mark_disconnected(name);
        info!("Disconnected from {}", name);
        self.emit(ServiceEvent::DeviceDisconnected(name.to_string()));

        for waiter in self.disconnect_waiters.remove(name).unwrap_or_default() {
            let _ = waiter.send(());
        }

        if self.scan.scanning {
            let due = self.clock.now() + self.config.reconnect_cooldown;
            self.timers.schedule(
                due,
                Timer::Requeue {
                    name: name.to_string(),
                },
            );
        }

        self.pump();
    }

    /// Give up on attempts that have been connecting too long
    pub(super) fn check_timeouts(&mut self, now: Instant) {
        let timeout = self.config.connect_timeout;
        let expired: Vec<String> = self
            .registry
            .iter()
            .filter(|d| {
                d.connecting
                    && d.connection_started
                        .map(|started| now.saturating_duration_since(started) > timeout)
                        .unwrap_or(false)
            })
            .map(|d| d.name().to_string())
            .collect();

        for name in expired {
            if let Some(device) = self.registry.get_mut(&name) {
                warn!("Connection to {} timed out", name);
                device.clear_link();
            }
            self.queue.push_back(&name);
            self.emit(ServiceEvent::ConnectionTimedOut(name));
        }
    }
}
