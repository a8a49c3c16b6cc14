//! BLE Scanner Module
//!
//! Keeps one scan session alive while any target is unconnected, restarts
//! stale sessions, and matches advertisements against registered targets.

use crate::domain::models::{ServiceEvent, TargetDevice};
use crate::infrastructure::bluetooth::service::BluetoothService;
use crate::infrastructure::bluetooth::transport::{BleTransport, Link};
use std::time::Instant;
use tracing::{debug, error, info, trace};

/// Lifecycle of the native transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
}

#[derive(Debug, Default)]
pub struct ScanState {
    pub scanning: bool,
    pub transport: TransportState,
    /// When the current native scan session was issued
    pub session_started: Option<Instant>,
}

/// Pick the target an advertised name belongs to.
///
/// A target matches when its name is contained in the advertised name. The
/// longest matching name wins so "Robot2_unit" goes to "Robot2" rather than
/// "Robot"; equal lengths fall back to registration order.
pub fn match_target<'a>(
    targets: impl IntoIterator<Item = &'a TargetDevice>,
    advertised: &str,
) -> Option<&'a TargetDevice> {
    let mut best: Option<&TargetDevice> = None;
    for device in targets {
        if !advertised.contains(device.name()) {
            continue;
        }
        if best.map_or(true, |b| device.name().len() > b.name().len()) {
            best = Some(device);
        }
    }
    best
}

impl<T: BleTransport> BluetoothService<T> {
    pub fn is_scanning(&self) -> bool {
        self.scan.scanning
    }

    /// Start discovering targets. Returns false if a scan is already active.
    ///
    /// Every target goes back to "not yet discovered" and the connected set
    /// and queue are cleared. The transport is initialised on first use.
    pub fn start_scan(&mut self) -> bool {
        if self.scan.scanning {
            debug!("Already scanning");
            return false;
        }

        info!(
            "Starting BLE scan, target devices: {}",
            self.registry.len()
        );
        self.scan.scanning = true;

        for device in self.registry.iter_mut() {
            // Links orphaned by the reset are closed
            if let Some((address, generation)) = device.link() {
                let link = Link::new(address, generation);
                if device.subscribed {
                    self.transport.unsubscribe(&link, &device.config.notify);
                }
                self.transport.disconnect(&link);
            }
            device.reset_transient();
        }
        self.registry.clear_connected();
        self.queue.clear();
        self.timers.retain(|_| false);
        self.disconnect_waiters.clear();

        self.emit(ServiceEvent::ScanStarted);

        match self.scan.transport {
            TransportState::Uninitialized => {
                info!("Initializing BLE transport...");
                self.scan.transport = TransportState::Initializing;
                self.transport.initialize();
            }
            TransportState::Initializing => {
                debug!("Transport still initializing, scan will start when ready");
            }
            TransportState::Ready => self.begin_native_scan(),
        }
        true
    }

    /// Stop the active scan session. Safe to call when not scanning.
    pub fn stop_scan(&mut self) {
        let was_scanning = self.scan.scanning;
        self.scan.scanning = false;
        self.scan.session_started = None;

        if self.scan.transport == TransportState::Ready {
            self.transport.stop_scan();
        }

        if was_scanning {
            info!("BLE scan stopped");
            self.emit(ServiceEvent::ScanStopped);
        }
    }

    /// Keep existing connections and continue scanning for the rest
    pub fn resume_scan(&mut self) -> bool {
        if self.scan.scanning || self.registry.unconnected_count() == 0 {
            return false;
        }

        for name in self.registry.connected() {
            debug!("Keeping connection to {}", name);
        }
        info!(
            "Resuming scan for {} unconnected devices",
            self.registry.unconnected_count()
        );
        self.scan.scanning = true;
        self.emit(ServiceEvent::ScanStarted);

        match self.scan.transport {
            TransportState::Uninitialized => {
                self.scan.transport = TransportState::Initializing;
                self.transport.initialize();
            }
            TransportState::Initializing => {}
            TransportState::Ready => self.begin_native_scan(),
        }
        // Devices dropped while the scan was off still know their address
        self.connect_all_pending_devices();
        true
    }

    fn begin_native_scan(&mut self) {
        if !self.scan.scanning {
            return;
        }

        self.scan.session_started = Some(self.clock.now());
        self.transport.scan_for_peripherals(&[], false);
        info!("Looking for devices: {}", self.registry.names().join(", "));
    }

    pub(super) fn on_transport_initialized(&mut self) {
        info!("BLE transport initialized");
        self.scan.transport = TransportState::Ready;
        self.begin_native_scan();
    }

    pub(super) fn on_transport_failed(&mut self, reason: String) {
        error!("BLE transport initialization failed: {}", reason);
        self.scan.transport = TransportState::Uninitialized;
        self.scan.scanning = false;
        self.scan.session_started = None;
        self.emit(ServiceEvent::TransportFailed(reason));
    }

    /// Some scanners silently stop reporting peripherals; restart long
    /// sessions while devices are still missing.
    pub(super) fn check_scan_restart(&mut self, now: Instant) {
        if !self.scan.scanning || self.scan.transport != TransportState::Ready {
            return;
        }
        let Some(started) = self.scan.session_started else {
            return;
        };
        if now.saturating_duration_since(started) <= self.config.scan_restart_interval {
            return;
        }
        if self.registry.unconnected_count() == 0 {
            return;
        }

        info!("Restarting scan to look for unconnected devices...");
        self.transport.stop_scan();
        self.begin_native_scan();
    }

    pub(super) fn on_device_found(&mut self, address: &str, advertised: Option<&str>) {
        if !self.scan.scanning {
            return;
        }
        let Some(advertised) = advertised.filter(|name| !name.is_empty()) else {
            return;
        };
        let Some(name) = match_target(self.registry.iter(), advertised).map(|d| d.name().to_string())
        else {
            return;
        };

        if self.registry.address_claimed(address, &name) {
            trace!("{} at {} already belongs to another target", advertised, address);
            return;
        }

        let Some(device) = self.registry.get_mut(&name) else {
            return;
        };
        if !device.is_idle() || device.address.is_some() {
            return;
        }

        info!("Found target device: {}, address: {}", advertised, address);
        device.address = Some(address.to_string());
        self.queue.push_back(&name);
        debug!(
            "Device {} queued for connection, queue length: {}",
            name,
            self.queue.len()
        );

        self.emit(ServiceEvent::DeviceDiscovered {
            name,
            address: address.to_string(),
        });
    }
}
