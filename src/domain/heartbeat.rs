//! Reliable heartbeat delivery.
//!
//! Retries a write while nudging the connection manager to bring the device
//! back, waiting between attempts.

use crate::error::BleError;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// The operations a heartbeat needs from the connection manager
pub trait HeartbeatLink {
    /// Write `payload` if the device is connected right now.
    /// Returns whether the write was issued.
    fn try_send(
        &self,
        device_name: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<bool, BleError>> + Send;

    /// Make sure the device is a target and put it at the front of the queue.
    fn request_reconnect(&self, device_name: &str)
        -> impl Future<Output = Result<(), BleError>> + Send;
}

/// Try up to `max_retries + 1` times to write `payload` to `device_name`.
///
/// Between attempts the device is re-registered and reconnected with high
/// priority, then `retry_delay` elapses. No reconnect is requested after the
/// final attempt. Errors that a reconnect cannot cure end the loop early.
pub async fn send_reliable<L: HeartbeatLink>(
    link: &L,
    device_name: &str,
    payload: &[u8],
    max_retries: u32,
    retry_delay: Duration,
) -> bool {
    let attempts = max_retries.saturating_add(1);

    for attempt in 1..=attempts {
        match link.try_send(device_name, payload).await {
            Ok(true) => {
                info!("Heartbeat sent to {}", device_name);
                return true;
            }
            Ok(false) => {
                warn!(
                    "Device {} not connected, heartbeat attempt {}/{}",
                    device_name, attempt, attempts
                );
            }
            Err(e) if e.is_permanent() => {
                error!("Heartbeat to {} cannot succeed: {}", device_name, e);
                return false;
            }
            Err(e) => {
                error!(
                    "Heartbeat to {} failed (attempt {}/{}): {}",
                    device_name, attempt, attempts, e
                );
            }
        }

        if attempt == attempts {
            break;
        }

        if let Err(e) = link.request_reconnect(device_name).await {
            error!("Reconnect request for {} failed: {}", device_name, e);
        }
        tokio::time::sleep(retry_delay).await;
    }

    error!("Heartbeat to {} failed after {} attempts", device_name, attempts);
    false
}
