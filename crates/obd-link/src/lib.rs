//! Bluetooth Link Layer for ELM327 Adapters
//!
//! Finds the configured adapter, resolves its UART-like GATT service,
//! subscribes to notifications and keeps the connection alive with
//! backoff-driven reconnection and an idle watchdog.
//!
//! ## Radio back-ends
//!
//! - [`SimulatedAdapter`]: in-process ELM327 emulator, always available
//! - `BleRadio`: BLE central via `btleplug` (feature `ble`)
//! - `SerialRadio`: Classic Bluetooth SPP or USB serial via `tokio-serial`
//!   (feature `serial`)

mod backoff;
mod config;
mod error;
mod gatt;
mod manager;
mod radio;
mod simulated;
mod writer;

#[cfg(feature = "ble")]
mod ble;
#[cfg(feature = "serial")]
mod serial;

pub use backoff::Backoff;
pub use config::LinkConfig;
pub use error::LinkError;
pub use gatt::{
    bluetooth_uuid, default_candidates, resolve_uart, UartCandidate, UartHandles,
    NORDIC_UART_NOTIFY, NORDIC_UART_SERVICE, NORDIC_UART_WRITE,
};
pub use manager::LinkManager;
pub use radio::{
    CharacteristicProperties, DeviceAddress, GattCharacteristic, GattService, Radio, RadioEvent,
    WriteMode,
};
pub use simulated::{EngineState, RadioOp, SimulatedAdapter};
pub use writer::{LinkWriter, UartSlot};

#[cfg(feature = "ble")]
pub use ble::BleRadio;
#[cfg(feature = "serial")]
pub use serial::SerialRadio;
