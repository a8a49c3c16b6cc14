use ble_link_manager::domain::settings::SettingsService;
use ble_link_manager::infrastructure::bluetooth::native::BtleplugTransport;
use ble_link_manager::infrastructure::bluetooth::{spawn_service, BluetoothService};
use ble_link_manager::infrastructure::clock::TokioClock;
use ble_link_manager::infrastructure::logging;
use ble_link_manager::{DataHandler, ServiceEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

fn hex(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!(
        "Starting BLE link manager, settings at {}",
        settings_service.path().display()
    );

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let transport = BtleplugTransport::new(transport_tx)?;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let service = BluetoothService::from_settings(transport, &settings, Arc::new(TokioClock))
        .with_event_sender(events_tx);
    let (handle, task) = spawn_service(service, transport_rx, &settings.timing);

    let printer: Arc<dyn DataHandler> = Arc::new(|name: &str, payload: &[u8]| -> anyhow::Result<()> {
        info!("{} -> [{}]", name, hex(payload));
        Ok(())
    });
    handle.register_data_handler(printer).await?;

    if !handle.start_scan().await? {
        warn!("Scan was already running");
    }

    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(ServiceEvent::TransportFailed(reason)) => {
                    error!("Bluetooth unavailable: {}", reason);
                    break;
                }
                Some(event) => info!("{:?}", event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    for name in handle.connected_devices().await? {
        handle.disconnect_device(&name).await?;
    }
    handle.shutdown()?;
    task.await?;
    Ok(())
}
