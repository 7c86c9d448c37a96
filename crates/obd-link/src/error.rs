//! Link Error Types

use obd_protocol::ObdError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while finding, connecting or talking to the adapter
#[derive(Debug, Error)]
pub enum LinkError {
    /// Radio stack reported a failure
    #[error("Radio error: {0}")]
    Radio(String),

    /// Connect did not finish within the stuck-detector ceiling
    #[error("Connection attempt stuck for {0}ms")]
    ConnectTimeout(u64),

    /// None of the discovered services looks like a UART bridge
    #[error("No UART-like service among {0} discovered services")]
    UartServiceMissing(usize),

    /// A UART service was found but lacks the needed characteristic
    #[error("Service {service} has no {role} characteristic")]
    CharacteristicMissing { service: Uuid, role: &'static str },

    /// No target device address configured
    #[error("No target device address configured")]
    MissingDeviceAddress,

    /// Connect requested for a device the scan never reported
    #[error("Device {0} has not been discovered")]
    UnknownDevice(String),

    /// Operation needs an established connection
    #[error("Radio link not ready")]
    NotReady,

    /// Serial port failure
    #[error("Serial port error: {0}")]
    Serial(String),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LinkError> for ObdError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::NotReady => ObdError::NotConnected,
            other => ObdError::Transport(other.to_string()),
        }
    }
}

#[cfg(feature = "ble")]
impl From<btleplug::Error> for LinkError {
    fn from(err: btleplug::Error) -> Self {
        LinkError::Radio(err.to_string())
    }
}

#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for LinkError {
    fn from(err: tokio_serial::Error) -> Self {
        LinkError::Serial(err.to_string())
    }
}
