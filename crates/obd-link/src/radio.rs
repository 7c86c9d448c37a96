//! Radio Abstraction
//!
//! The lifecycle manager drives any radio stack through [`Radio`] and
//! receives its asynchronous activity as [`RadioEvent`]s on a channel.

use crate::error::LinkError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Device identity: a Bluetooth address or a serial port path.
///
/// Compared case-insensitively, with `-` and `:` treated alike.
#[derive(Debug, Clone)]
pub struct DeviceAddress {
    raw: String,
    key: String,
}

impl DeviceAddress {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into().trim().to_string();
        let key = raw.to_ascii_uppercase().replace('-', ":");
        Self { raw, key }
    }

    /// Address as it was given
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for DeviceAddress {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for DeviceAddress {}

impl Hash for DeviceAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// GATT characteristic capability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub notify: bool,
    pub indicate: bool,
    pub write: bool,
    pub write_without_response: bool,
}

impl CharacteristicProperties {
    /// Can deliver inbound bytes
    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }

    /// Can accept outbound bytes
    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// A discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    /// Owning service
    pub service: Uuid,
    pub properties: CharacteristicProperties,
}

/// A discovered primary service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// ATT write flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Asynchronous radio activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// Scan reported a device
    DeviceDiscovered {
        address: DeviceAddress,
        name: Option<String>,
    },
    /// The radio ended the scan on its own
    ScanStopped,
    /// The connected device went away
    Disconnected { reason: String },
    /// Notification payload from the subscribed characteristic
    Notification(Bytes),
}

/// Operations the lifecycle manager needs from a radio stack.
///
/// Every call resolves once the radio acknowledges it; `set_notify` in
/// particular must not return before the descriptor write is confirmed.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Name for logging
    fn name(&self) -> &str;

    async fn start_scan(&self) -> Result<(), LinkError>;

    async fn stop_scan(&self) -> Result<(), LinkError>;

    async fn connect(&self, address: &DeviceAddress) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;

    async fn discover_services(&self) -> Result<Vec<GattService>, LinkError>;

    /// Write the notification configuration descriptor
    async fn set_notify(
        &self,
        characteristic: &GattCharacteristic,
        enabled: bool,
    ) -> Result<(), LinkError>;

    async fn write(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), LinkError>;

    /// Drop pending connection attempts and any filter/allow-list state
    async fn reset(&self) -> Result<(), LinkError>;
}
