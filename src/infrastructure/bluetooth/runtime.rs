//! Bluetooth Runtime Module
//!
//! Runs a [`BluetoothService`] on its own tokio task. Commands from any
//! number of [`BluetoothHandle`]s, transport events and the periodic tick are
//! multiplexed onto the one task, so the service itself never needs a lock.

use crate::domain::dispatch::DataHandler;
use crate::domain::heartbeat::{self, HeartbeatLink};
use crate::domain::models::{ConnectionState, Priority, TargetConfig};
use crate::domain::settings::TimingSettings;
use crate::error::{BleError, Result};
use crate::infrastructure::bluetooth::service::BluetoothService;
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Requests handled by the service task
pub enum BluetoothCommand {
    AddTarget(TargetConfig, oneshot::Sender<bool>),
    UpsertTarget(TargetConfig, oneshot::Sender<bool>),
    RemoveTarget(String, oneshot::Sender<bool>),
    RemoveAllTargets,
    StartScan(oneshot::Sender<bool>),
    StopScan,
    ResumeScan(oneshot::Sender<bool>),
    Connect {
        name: String,
        priority: Priority,
        reply: oneshot::Sender<bool>,
    },
    ConnectAllPending,
    /// Reply fires once the link is gone
    Disconnect {
        name: String,
        reply: oneshot::Sender<()>,
    },
    DisconnectAll,
    Send {
        name: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    TrySend {
        name: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<bool>>,
    },
    Broadcast {
        payload: Vec<u8>,
        reply: oneshot::Sender<usize>,
    },
    RequestReconnect(String, oneshot::Sender<()>),
    RegisterHandler(Arc<dyn DataHandler>, oneshot::Sender<bool>),
    UnregisterHandler(Arc<dyn DataHandler>, oneshot::Sender<bool>),
    State(String, oneshot::Sender<ConnectionState>),
    ConnectedDevices(oneshot::Sender<Vec<String>>),
    TargetNames(oneshot::Sender<Vec<String>>),
    IsScanning(oneshot::Sender<bool>),
    Shutdown,
}

/// Start the service task.
///
/// `transport_events` is the receiving end of the channel the transport
/// reports on. The task stops on [`BluetoothHandle::shutdown`] or once every
/// handle is dropped, disconnecting all devices on the way out.
pub fn spawn_service<T>(
    service: BluetoothService<T>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    timing: &TimingSettings,
) -> (BluetoothHandle, JoinHandle<()>)
where
    T: BleTransport + 'static,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(
        service,
        commands_rx,
        transport_events,
        timing.tick_interval(),
    ));

    let handle = BluetoothHandle {
        commands: commands_tx,
        disconnect_timeout: timing.disconnect_timeout(),
        heartbeat_retry_delay: timing.heartbeat_retry_delay(),
    };
    (handle, task)
}

async fn run<T: BleTransport>(
    mut service: BluetoothService<T>,
    mut commands: mpsc::UnboundedReceiver<BluetoothCommand>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    tick_interval: Duration,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Bluetooth service task started");
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(BluetoothCommand::Shutdown) | None => break,
                Some(command) => apply(&mut service, command),
            },
            Some(event) = transport_events.recv() => service.handle_event(event),
            _ = ticker.tick() => service.tick(),
        }
    }

    service.disconnect_all_devices();
    info!("Bluetooth service task stopped");
}

fn apply<T: BleTransport>(service: &mut BluetoothService<T>, command: BluetoothCommand) {
    // A dropped reply receiver only means the caller stopped waiting
    match command {
        BluetoothCommand::AddTarget(config, reply) => {
            let _ = reply.send(service.add_target(config));
        }
        BluetoothCommand::UpsertTarget(config, reply) => {
            let _ = reply.send(service.upsert_target(config));
        }
        BluetoothCommand::RemoveTarget(name, reply) => {
            let _ = reply.send(service.remove_target(&name));
        }
        BluetoothCommand::RemoveAllTargets => service.remove_all_targets(),
        BluetoothCommand::StartScan(reply) => {
            let _ = reply.send(service.start_scan());
        }
        BluetoothCommand::StopScan => service.stop_scan(),
        BluetoothCommand::ResumeScan(reply) => {
            let _ = reply.send(service.resume_scan());
        }
        BluetoothCommand::Connect {
            name,
            priority,
            reply,
        } => {
            let _ = reply.send(service.connect_device_with_priority(&name, priority));
        }
        BluetoothCommand::ConnectAllPending => service.connect_all_pending_devices(),
        BluetoothCommand::Disconnect { name, reply } => {
            if service.disconnect_device(&name) {
                service.notify_on_disconnect(&name, reply);
            } else {
                let _ = reply.send(());
            }
        }
        BluetoothCommand::DisconnectAll => service.disconnect_all_devices(),
        BluetoothCommand::Send {
            name,
            payload,
            reply,
        } => {
            let _ = reply.send(service.send_data_to_device(&name, &payload));
        }
        BluetoothCommand::TrySend {
            name,
            payload,
            reply,
        } => {
            let _ = reply.send(service.try_send(&name, &payload));
        }
        BluetoothCommand::Broadcast { payload, reply } => {
            let _ = reply.send(service.broadcast_data(&payload));
        }
        BluetoothCommand::RequestReconnect(name, reply) => {
            service.request_reconnect(&name);
            let _ = reply.send(());
        }
        BluetoothCommand::RegisterHandler(handler, reply) => {
            let _ = reply.send(service.register_data_handler(handler));
        }
        BluetoothCommand::UnregisterHandler(handler, reply) => {
            let _ = reply.send(service.unregister_data_handler(&handler));
        }
        BluetoothCommand::State(name, reply) => {
            let _ = reply.send(service.connection_state(&name));
        }
        BluetoothCommand::ConnectedDevices(reply) => {
            let _ = reply.send(service.connected_devices());
        }
        BluetoothCommand::TargetNames(reply) => {
            let _ = reply.send(service.target_names());
        }
        BluetoothCommand::IsScanning(reply) => {
            let _ = reply.send(service.is_scanning());
        }
        BluetoothCommand::Shutdown => {}
    }
}

/// Cloneable async front end to the service task
#[derive(Debug, Clone)]
pub struct BluetoothHandle {
    commands: mpsc::UnboundedSender<BluetoothCommand>,
    disconnect_timeout: Duration,
    heartbeat_retry_delay: Duration,
}

impl BluetoothHandle {
    fn post(&self, command: BluetoothCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| BleError::ServiceUnavailable)
    }

    async fn request<R>(&self, command: impl FnOnce(oneshot::Sender<R>) -> BluetoothCommand) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.post(command(reply))?;
        response.await.map_err(|_| BleError::ServiceUnavailable)
    }

    pub async fn add_target(&self, config: TargetConfig) -> Result<bool> {
        self.request(|reply| BluetoothCommand::AddTarget(config, reply))
            .await
    }

    pub async fn upsert_target(&self, config: TargetConfig) -> Result<bool> {
        self.request(|reply| BluetoothCommand::UpsertTarget(config, reply))
            .await
    }

    pub async fn remove_target(&self, name: &str) -> Result<bool> {
        self.request(|reply| BluetoothCommand::RemoveTarget(name.to_string(), reply))
            .await
    }

    pub fn remove_all_targets(&self) -> Result<()> {
        self.post(BluetoothCommand::RemoveAllTargets)
    }

    pub async fn start_scan(&self) -> Result<bool> {
        self.request(BluetoothCommand::StartScan).await
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.post(BluetoothCommand::StopScan)
    }

    pub async fn resume_scan(&self) -> Result<bool> {
        self.request(BluetoothCommand::ResumeScan).await
    }

    pub async fn is_scanning(&self) -> Result<bool> {
        self.request(BluetoothCommand::IsScanning).await
    }

    pub async fn connect_device_with_priority(&self, name: &str, priority: Priority) -> Result<bool> {
        self.request(|reply| BluetoothCommand::Connect {
            name: name.to_string(),
            priority,
            reply,
        })
        .await
    }

    pub fn connect_all_pending_devices(&self) -> Result<()> {
        self.post(BluetoothCommand::ConnectAllPending)
    }

    /// Disconnect and wait for the link to close, up to the configured
    /// disconnect timeout
    pub async fn disconnect_device(&self, name: &str) -> Result<()> {
        let (reply, closed) = oneshot::channel();
        self.post(BluetoothCommand::Disconnect {
            name: name.to_string(),
            reply,
        })?;

        match tokio::time::timeout(self.disconnect_timeout, closed).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                debug!("Disconnect of {} superseded before completion", name);
                Ok(())
            }
            Err(_) => {
                warn!("Timed out waiting for {} to disconnect", name);
                Ok(())
            }
        }
    }

    pub fn disconnect_all_devices(&self) -> Result<()> {
        self.post(BluetoothCommand::DisconnectAll)
    }

    pub async fn send_data_to_device(&self, name: &str, payload: &[u8]) -> Result<()> {
        self.request(|reply| BluetoothCommand::Send {
            name: name.to_string(),
            payload: payload.to_vec(),
            reply,
        })
        .await?
    }

    pub async fn broadcast_data(&self, payload: &[u8]) -> Result<usize> {
        self.request(|reply| BluetoothCommand::Broadcast {
            payload: payload.to_vec(),
            reply,
        })
        .await
    }

    /// Deliver a heartbeat, reconnecting between attempts.
    /// See [`heartbeat::send_reliable`].
    pub async fn send_reliable_heartbeat(&self, name: &str, payload: &[u8], max_retries: u32) -> bool {
        heartbeat::send_reliable(self, name, payload, max_retries, self.heartbeat_retry_delay).await
    }

    pub async fn register_data_handler(&self, handler: Arc<dyn DataHandler>) -> Result<bool> {
        self.request(|reply| BluetoothCommand::RegisterHandler(handler, reply))
            .await
    }

    pub async fn unregister_data_handler(&self, handler: Arc<dyn DataHandler>) -> Result<bool> {
        self.request(|reply| BluetoothCommand::UnregisterHandler(handler, reply))
            .await
    }

    pub async fn connection_state(&self, name: &str) -> Result<ConnectionState> {
        self.request(|reply| BluetoothCommand::State(name.to_string(), reply))
            .await
    }

    pub async fn device_status(&self, name: &str) -> Result<String> {
        Ok(self.connection_state(name).await?.to_string())
    }

    pub async fn is_device_connected(&self, name: &str) -> Result<bool> {
        Ok(self.connection_state(name).await? == ConnectionState::Connected)
    }

    pub async fn is_target_device(&self, name: &str) -> Result<bool> {
        Ok(self.connection_state(name).await? != ConnectionState::NotConfigured)
    }

    pub async fn connected_devices(&self) -> Result<Vec<String>> {
        self.request(BluetoothCommand::ConnectedDevices).await
    }

    pub async fn target_names(&self) -> Result<Vec<String>> {
        self.request(BluetoothCommand::TargetNames).await
    }

    /// Ask the task to disconnect everything and exit
    pub fn shutdown(&self) -> Result<()> {
        self.post(BluetoothCommand::Shutdown)
    }
}

impl HeartbeatLink for BluetoothHandle {
    async fn try_send(&self, device_name: &str, payload: &[u8]) -> Result<bool> {
        self.request(|reply| BluetoothCommand::TrySend {
            name: device_name.to_string(),
            payload: payload.to_vec(),
            reply,
        })
        .await?
    }

    async fn request_reconnect(&self, device_name: &str) -> Result<()> {
        self.request(|reply| BluetoothCommand::RequestReconnect(device_name.to_string(), reply))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{GattEndpoint, ServiceEvent};
    use crate::domain::settings::Settings;
    use crate::infrastructure::bluetooth::simulated::{SimulatedPeripheral, SimulatedTransport};
    use crate::infrastructure::clock::TokioClock;
    use crate::test_utils::robot;
    use tokio::time::{timeout, Instant};

    struct Harness {
        handle: BluetoothHandle,
        task: JoinHandle<()>,
        simulator: SimulatedTransport,
        events: mpsc::UnboundedReceiver<ServiceEvent>,
    }

    fn robot_peripheral() -> SimulatedPeripheral {
        SimulatedPeripheral::new("AA:BB", "Robot_X")
            .with_characteristic(GattEndpoint::new("fff0", "fff2"))
            .with_characteristic(GattEndpoint::new("fff0", "fff1"))
            .with_initial_value(vec![0x01])
    }

    fn start(peripheral: SimulatedPeripheral) -> Harness {
        let settings = Settings {
            targets: vec![robot()],
            ..Settings::default()
        };
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let simulator = SimulatedTransport::new(transport_tx).with_peripheral(peripheral);
        let (events_tx, events) = mpsc::unbounded_channel();

        let service = BluetoothService::from_settings(
            simulator.clone(),
            &settings,
            Arc::new(TokioClock),
        )
        .with_event_sender(events_tx);
        let (handle, task) = spawn_service(service, transport_rx, &settings.timing);

        Harness {
            handle,
            task,
            simulator,
            events,
        }
    }

    async fn wait_for(events: &mut mpsc::UnboundedReceiver<ServiceEvent>, wanted: ServiceEvent) {
        timeout(Duration::from_secs(30), async {
            while let Some(event) = events.recv().await {
                if event == wanted {
                    return;
                }
            }
        })
        .await
        .expect("event not observed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_connects_and_dispatches_data() {
        let mut harness = start(robot_peripheral());
        let (data_tx, mut data_rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn DataHandler> =
            Arc::new(move |name: &str, data: &[u8]| -> anyhow::Result<()> {
                data_tx.send((name.to_string(), data.to_vec()))?;
                Ok(())
            });
        assert!(harness.handle.register_data_handler(handler).await.unwrap());

        assert!(harness.handle.start_scan().await.unwrap());
        wait_for(&mut harness.events, ServiceEvent::AllDevicesConnected).await;

        assert!(harness.handle.is_device_connected("Robot").await.unwrap());
        assert_eq!(harness.handle.device_status("Robot").await.unwrap(), "connected");
        assert!(!harness.handle.is_scanning().await.unwrap());

        // Initial read seeds the cache and is dispatched
        assert_eq!(data_rx.recv().await.unwrap(), ("Robot".to_string(), vec![0x01]));

        harness.simulator.notify("AA:BB", "fff1", &[0x01]);
        harness.simulator.notify("AA:BB", "fff1", &[0x02]);
        assert_eq!(data_rx.recv().await.unwrap(), ("Robot".to_string(), vec![0x02]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_disconnect() {
        let mut harness = start(robot_peripheral());
        harness.handle.start_scan().await.unwrap();
        wait_for(&mut harness.events, ServiceEvent::AllDevicesConnected).await;

        harness
            .handle
            .send_data_to_device("Robot", &[0xAA, 0x55])
            .await
            .unwrap();
        assert_eq!(harness.handle.broadcast_data(&[0x01]).await.unwrap(), 1);
        assert_eq!(
            harness.simulator.written(),
            vec![
                ("AA:BB".to_string(), vec![0xAA, 0x55]),
                ("AA:BB".to_string(), vec![0x01])
            ]
        );

        harness.handle.disconnect_device("Robot").await.unwrap();
        assert!(!harness.handle.is_device_connected("Robot").await.unwrap());
        assert_eq!(
            harness.handle.send_data_to_device("Robot", &[0x01]).await,
            Err(BleError::NotConnected("Robot".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_gives_up_on_unreachable_device() {
        let mut harness = start(robot_peripheral().unreachable());
        harness.handle.start_scan().await.unwrap();
        wait_for(
            &mut harness.events,
            ServiceEvent::DeviceDiscovered {
                name: "Robot".into(),
                address: "AA:BB".into(),
            },
        )
        .await;

        let started = Instant::now();
        let sent = harness
            .handle
            .send_reliable_heartbeat("Robot", &[0x01], 2)
            .await;

        assert!(!sent);
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reconnects_dropped_device() {
        let mut harness = start(robot_peripheral());
        harness.handle.start_scan().await.unwrap();
        wait_for(&mut harness.events, ServiceEvent::AllDevicesConnected).await;

        // Scan has stopped, so nothing but the heartbeat brings it back
        assert!(harness.simulator.drop_link("AA:BB"));
        wait_for(
            &mut harness.events,
            ServiceEvent::DeviceDisconnected("Robot".into()),
        )
        .await;

        assert!(
            harness
                .handle
                .send_reliable_heartbeat("Robot", &[0x01], 2)
                .await
        );
        assert!(harness.handle.is_device_connected("Robot").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_and_closes_handle() {
        let mut harness = start(robot_peripheral());
        harness.handle.start_scan().await.unwrap();
        wait_for(&mut harness.events, ServiceEvent::AllDevicesConnected).await;

        harness.handle.shutdown().unwrap();
        harness.task.await.unwrap();

        assert!(!harness.simulator.is_linked("AA:BB"));
        assert_eq!(
            harness.handle.start_scan().await,
            Err(BleError::ServiceUnavailable)
        );
    }
}
