use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Device '{0}' is not connected")]
    NotConnected(String),
    #[error("Device '{0}' is not a registered target")]
    UnknownDevice(String),
    #[error("Device '{0}' has no write characteristic")]
    NoWriteCharacteristic(String),
    #[error("Bluetooth service is not running")]
    ServiceUnavailable,
    #[error("Transport error: {0}")]
    Transport(String),
}

impl BleError {
    /// Errors a reconnect cannot cure
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NoWriteCharacteristic(_) | Self::ServiceUnavailable)
    }
}

pub type Result<T> = std::result::Result<T, BleError>;
