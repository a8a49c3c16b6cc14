//! Native transport backed by `btleplug`.
//!
//! Each [`BleTransport`] call spawns a short task on the current tokio
//! runtime and reports its outcome on the event channel. Peripherals are
//! addressed by their btleplug id string.

use crate::domain::models::GattEndpoint;
use crate::infrastructure::bluetooth::links::LinkTable;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{BleTransport, Link, LinkEvent, TransportEvent};
use anyhow::{anyhow, Context, Result};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Default)]
struct Shared {
    adapter: Mutex<Option<Adapter>>,
    peripherals: Mutex<HashMap<String, Peripheral>>,
    /// Live link per address, for routing notifications and drops
    links: Mutex<LinkTable>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct BtleplugTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    runtime: Handle,
    shared: Arc<Shared>,
}

impl BtleplugTransport {
    /// Must be called from within a tokio runtime
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Result<Self> {
        let runtime = Handle::try_current().context("btleplug transport needs a tokio runtime")?;
        Ok(Self {
            events,
            runtime,
            shared: Arc::new(Shared::default()),
        })
    }

    fn spawn<F>(&self, operation: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.runtime.spawn(async move {
            if let Err(e) = task.await {
                warn!("BLE {} failed: {:#}", operation, e);
            }
        });
    }

    fn adapter(&self) -> Result<Adapter> {
        lock(&self.shared.adapter)
            .clone()
            .ok_or_else(|| anyhow!("BLE adapter not initialized"))
    }

    fn peripheral(&self, address: &str) -> Result<Peripheral> {
        lock(&self.shared.peripherals)
            .get(address)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown peripheral {}", address))
    }

    fn send(events: &mpsc::UnboundedSender<TransportEvent>, event: TransportEvent) {
        if events.send(event).is_err() {
            debug!("BLE event receiver dropped");
        }
    }

    fn send_link(events: &mpsc::UnboundedSender<TransportEvent>, link: &Link, event: LinkEvent) {
        Self::send(
            events,
            TransportEvent::Link {
                link: link.clone(),
                event,
            },
        );
    }

    async fn open_adapter() -> Result<Adapter> {
        let manager = Manager::new().await?;
        manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))
    }

    /// Forward discoveries and link drops from the adapter event stream
    async fn watch_adapter(
        adapter: Adapter,
        shared: Arc<Shared>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()> {
        let mut stream = adapter.events().await?;
        while let Some(event) = stream.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    let peripheral = match adapter.peripheral(&id).await {
                        Ok(peripheral) => peripheral,
                        Err(e) => {
                            trace!("Peripheral {:?} vanished: {}", id, e);
                            continue;
                        }
                    };
                    let Ok(Some(properties)) = peripheral.properties().await else {
                        continue;
                    };
                    let address = id.to_string();
                    lock(&shared.peripherals).insert(address.clone(), peripheral);
                    Self::send(
                        &events,
                        TransportEvent::DeviceFound {
                            address,
                            name: properties.local_name,
                            rssi: properties.rssi,
                        },
                    );
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let link = lock(&shared.links).retire(&id.to_string());
                    if let Some(link) = link {
                        info!("Peripheral {} dropped the link", link.address);
                        Self::send_link(&events, &link, LinkEvent::Disconnected);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn find_characteristic(peripheral: &Peripheral, endpoint: &GattEndpoint) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                protocol::uuid_eq(&c.service_uuid.to_string(), &endpoint.service)
                    && protocol::uuid_eq(&c.uuid.to_string(), &endpoint.characteristic)
            })
            .ok_or_else(|| {
                anyhow!(
                    "Characteristic {}/{} not found",
                    endpoint.service,
                    endpoint.characteristic
                )
            })
    }
}

impl BleTransport for BtleplugTransport {
    fn initialize(&mut self) {
        let shared = self.shared.clone();
        let events = self.events.clone();
        let runtime = self.runtime.clone();

        self.spawn("initialize", async move {
            let adapter = match Self::open_adapter().await {
                Ok(adapter) => adapter,
                Err(e) => {
                    Self::send(&events, TransportEvent::InitFailed(e.to_string()));
                    return Ok(());
                }
            };
            if let Ok(info) = adapter.adapter_info().await {
                info!("Using Bluetooth adapter {}", info);
            }
            *lock(&shared.adapter) = Some(adapter.clone());

            let watch_events = events.clone();
            runtime.spawn(async move {
                if let Err(e) = Self::watch_adapter(adapter, shared, watch_events).await {
                    warn!("Adapter event stream ended: {:#}", e);
                }
            });

            Self::send(&events, TransportEvent::Initialized);
            Ok(())
        });
    }

    fn scan_for_peripherals(&mut self, service_filter: &[String], _allow_duplicates: bool) {
        let services = service_filter
            .iter()
            .filter_map(|uuid| Uuid::parse_str(&protocol::full_uuid(uuid)).ok())
            .collect();
        let adapter = self.adapter();

        self.spawn("scan", async move {
            adapter?.start_scan(ScanFilter { services }).await?;
            Ok(())
        });
    }

    fn stop_scan(&mut self) {
        let adapter = self.adapter();
        self.spawn("stop scan", async move {
            adapter?.stop_scan().await?;
            Ok(())
        });
    }

    fn connect(&mut self, link: &Link) {
        let peripheral = self.peripheral(&link.address);
        let shared = self.shared.clone();
        let events = self.events.clone();
        let runtime = self.runtime.clone();
        let link = link.clone();

        self.spawn("connect", async move {
            let peripheral = peripheral?;
            lock(&shared.links).open(link.clone());

            let connected = async {
                if !peripheral.is_connected().await? {
                    peripheral.connect().await?;
                }
                peripheral.discover_services().await?;
                Ok::<_, btleplug::Error>(())
            }
            .await;
            if let Err(e) = connected {
                lock(&shared.links).retire_link(&link);
                Self::send_link(&events, &link, LinkEvent::Disconnected);
                return Err(e.into());
            }
            Self::send_link(&events, &link, LinkEvent::Connected);

            // Notifications for this attempt, until the link is retired
            let mut notifications = peripheral.notifications().await?;
            let notify_events = events.clone();
            let notify_link = link.clone();
            let forwarder = runtime.spawn(async move {
                while let Some(notification) = notifications.next().await {
                    Self::send_link(
                        &notify_events,
                        &notify_link,
                        LinkEvent::ValueChanged {
                            characteristic: notification.uuid.to_string(),
                            value: notification.value,
                        },
                    );
                }
            });
            if !lock(&shared.links).attach(&link, forwarder.abort_handle()) {
                debug!("Link {} retired while connecting", link);
                return Ok(());
            }

            for characteristic in peripheral.characteristics() {
                Self::send_link(
                    &events,
                    &link,
                    LinkEvent::ServiceDiscovered {
                        service: characteristic.service_uuid.to_string(),
                        characteristic: characteristic.uuid.to_string(),
                    },
                );
            }
            Ok(())
        });
    }

    fn disconnect(&mut self, link: &Link) {
        let peripheral = self.peripheral(&link.address);
        let shared = self.shared.clone();
        let events = self.events.clone();
        let link = link.clone();

        self.spawn("disconnect", async move {
            let result = peripheral?.disconnect().await;
            let was_live = lock(&shared.links).retire_link(&link);
            if was_live {
                Self::send_link(&events, &link, LinkEvent::Disconnected);
            }
            result?;
            Ok(())
        });
    }

    fn request_mtu(&mut self, link: &Link, size: u16) {
        // btleplug leaves MTU negotiation to the platform stack
        debug!("MTU {} for {} is negotiated by the platform", size, link);
        Self::send_link(&self.events, link, LinkEvent::MtuChanged(size));
    }

    fn subscribe(&mut self, link: &Link, endpoint: &GattEndpoint) {
        let peripheral = self.peripheral(&link.address);
        let events = self.events.clone();
        let link = link.clone();
        let endpoint = endpoint.clone();

        self.spawn("subscribe", async move {
            let peripheral = peripheral?;
            let characteristic = Self::find_characteristic(&peripheral, &endpoint)?;
            peripheral.subscribe(&characteristic).await?;
            Self::send_link(
                &events,
                &link,
                LinkEvent::Subscribed {
                    characteristic: characteristic.uuid.to_string(),
                },
            );
            Ok(())
        });
    }

    fn unsubscribe(&mut self, link: &Link, endpoint: &GattEndpoint) {
        let peripheral = self.peripheral(&link.address);
        let endpoint = endpoint.clone();

        self.spawn("unsubscribe", async move {
            let peripheral = peripheral?;
            let characteristic = Self::find_characteristic(&peripheral, &endpoint)?;
            peripheral.unsubscribe(&characteristic).await?;
            Ok(())
        });
    }

    fn read(&mut self, link: &Link, endpoint: &GattEndpoint) {
        let peripheral = self.peripheral(&link.address);
        let events = self.events.clone();
        let link = link.clone();
        let endpoint = endpoint.clone();

        self.spawn("read", async move {
            let peripheral = peripheral?;
            let characteristic = Self::find_characteristic(&peripheral, &endpoint)?;
            let value = peripheral.read(&characteristic).await?;
            Self::send_link(
                &events,
                &link,
                LinkEvent::Read {
                    characteristic: characteristic.uuid.to_string(),
                    value,
                },
            );
            Ok(())
        });
    }

    fn write(&mut self, link: &Link, endpoint: &GattEndpoint, data: &[u8], with_response: bool) {
        let peripheral = self.peripheral(&link.address);
        let events = self.events.clone();
        let link = link.clone();
        let endpoint = endpoint.clone();
        let data = data.to_vec();
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.spawn("write", async move {
            let peripheral = peripheral?;
            let characteristic = Self::find_characteristic(&peripheral, &endpoint)?;
            peripheral.write(&characteristic, &data, write_type).await?;
            Self::send_link(
                &events,
                &link,
                LinkEvent::Written {
                    characteristic: characteristic.uuid.to_string(),
                },
            );
            Ok(())
        });
    }
}
