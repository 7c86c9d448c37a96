//! UART Service Resolution
//!
//! ELM327 BLE clones expose their serial bridge under different UUIDs
//! depending on firmware. Known candidates are tried first, then any
//! service offering both a notify and a write characteristic.

use crate::error::LinkError;
use crate::radio::{GattCharacteristic, GattService, WriteMode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Expand a 16-bit Bluetooth SIG UUID to its 128-bit form
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Nordic UART service
pub const NORDIC_UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Nordic UART TX (device to central, notify)
pub const NORDIC_UART_NOTIFY: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
/// Nordic UART RX (central to device, write)
pub const NORDIC_UART_WRITE: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// A known service / characteristic UUID triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartCandidate {
    pub service: Uuid,
    pub notify: Uuid,
    pub write: Uuid,
}

/// UUID layouts seen on ELM327 BLE adapters
pub fn default_candidates() -> Vec<UartCandidate> {
    vec![
        UartCandidate {
            service: NORDIC_UART_SERVICE,
            notify: NORDIC_UART_NOTIFY,
            write: NORDIC_UART_WRITE,
        },
        UartCandidate {
            service: bluetooth_uuid(0xFFF0),
            notify: bluetooth_uuid(0xFFF1),
            write: bluetooth_uuid(0xFFF2),
        },
        UartCandidate {
            service: bluetooth_uuid(0xFFE0),
            notify: bluetooth_uuid(0xFFE1),
            write: bluetooth_uuid(0xFFE1),
        },
        UartCandidate {
            service: bluetooth_uuid(0x18F0),
            notify: bluetooth_uuid(0x2AF0),
            write: bluetooth_uuid(0x2AF1),
        },
    ]
}

/// Characteristics carrying the adapter's serial stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartHandles {
    pub service: Uuid,
    /// Inbound: notify or indicate
    pub rx: GattCharacteristic,
    /// Outbound: write or write-without-response
    pub tx: GattCharacteristic,
    pub write_mode: WriteMode,
}

fn write_mode_for(tx: &GattCharacteristic) -> WriteMode {
    if tx.properties.write_without_response {
        WriteMode::WithoutResponse
    } else {
        WriteMode::WithResponse
    }
}

fn handles(service: Uuid, rx: &GattCharacteristic, tx: &GattCharacteristic) -> UartHandles {
    UartHandles {
        service,
        rx: rx.clone(),
        tx: tx.clone(),
        write_mode: write_mode_for(tx),
    }
}

fn by_capability(service: &GattService) -> Result<UartHandles, LinkError> {
    let rx = service
        .characteristics
        .iter()
        .find(|c| c.properties.can_notify())
        .ok_or(LinkError::CharacteristicMissing {
            service: service.uuid,
            role: "notify",
        })?;
    let tx = service
        .characteristics
        .iter()
        .find(|c| c.properties.write_without_response)
        .or_else(|| service.characteristics.iter().find(|c| c.properties.write))
        .ok_or(LinkError::CharacteristicMissing {
            service: service.uuid,
            role: "write",
        })?;
    Ok(handles(service.uuid, rx, tx))
}

/// Pick the UART service and its RX/TX characteristics
pub fn resolve_uart(
    services: &[GattService],
    candidates: &[UartCandidate],
) -> Result<UartHandles, LinkError> {
    let mut last_error = None;

    for candidate in candidates {
        let Some(service) = services.iter().find(|s| s.uuid == candidate.service) else {
            continue;
        };
        let rx = service
            .characteristics
            .iter()
            .find(|c| c.uuid == candidate.notify && c.properties.can_notify());
        let tx = service
            .characteristics
            .iter()
            .find(|c| c.uuid == candidate.write && c.properties.can_write());
        if let (Some(rx), Some(tx)) = (rx, tx) {
            info!("Using UART service {}", service.uuid);
            return Ok(handles(service.uuid, rx, tx));
        }

        // known service, unexpected characteristic UUIDs
        match by_capability(service) {
            Ok(found) => {
                info!("Using UART service {} (resolved by capability)", service.uuid);
                return Ok(found);
            }
            Err(e) => last_error = Some(e),
        }
    }

    for service in services {
        if let Ok(found) = by_capability(service) {
            info!("Using unlisted service {} as UART", service.uuid);
            return Ok(found);
        }
        debug!("Service {} has no notify/write pair", service.uuid);
    }

    Err(last_error.unwrap_or(LinkError::UartServiceMissing(services.len())))
}
