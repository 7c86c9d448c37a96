//! Link configuration

use crate::error::LinkError;
use crate::gatt::{default_candidates, UartCandidate};
use crate::radio::DeviceAddress;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Target adapter: Bluetooth address or serial port path. Required for
    /// real radios; there is no built-in default.
    pub device_address: String,

    /// Known UART service layouts, tried in order
    pub uart_candidates: Vec<UartCandidate>,

    /// Subscribe with enable, disable, enable
    pub notify_quirk: bool,

    /// Pause after each notification descriptor write (milliseconds)
    pub notify_settle_ms: u64,

    /// Scan window before giving up (milliseconds)
    pub scan_duration_ms: u64,

    /// Pause between a fruitless scan and the next (milliseconds)
    pub scan_restart_delay_ms: u64,

    /// Watchdog check period (milliseconds)
    pub watchdog_interval_ms: u64,

    /// Idle time after which the watchdog restarts discovery (milliseconds)
    pub idle_timeout_ms: u64,

    /// Ceiling for connect and GATT setup before a hard reset (milliseconds)
    pub connect_ceiling_ms: u64,

    /// First reconnection delay (milliseconds)
    pub backoff_initial_ms: u64,

    /// Reconnection delay cap (milliseconds)
    pub backoff_max_ms: u64,

    /// Largest single write payload (bytes)
    pub max_write_chunk: usize,

    /// Capacity of the radio event channel
    pub event_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_address: String::new(),
            uart_candidates: default_candidates(),
            notify_quirk: true,
            notify_settle_ms: 500,
            scan_duration_ms: 30_000,
            scan_restart_delay_ms: 5_000,
            watchdog_interval_ms: 10_000,
            idle_timeout_ms: 10_000,
            connect_ceiling_ms: 15_000,
            backoff_initial_ms: 3_000,
            backoff_max_ms: 30_000,
            max_write_chunk: 20,
            event_queue: 256,
        }
    }
}

impl LinkConfig {
    pub fn target(&self) -> DeviceAddress {
        DeviceAddress::new(self.device_address.clone())
    }

    /// Check the settings a real radio cannot run without
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.device_address.trim().is_empty() {
            return Err(LinkError::MissingDeviceAddress);
        }
        Ok(())
    }

    pub fn notify_settle(&self) -> Duration {
        Duration::from_millis(self.notify_settle_ms)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn scan_restart_delay(&self) -> Duration {
        Duration::from_millis(self.scan_restart_delay_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connect_ceiling(&self) -> Duration {
        Duration::from_millis(self.connect_ceiling_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_no_target() {
        let config = LinkConfig::default();
        assert!(config.device_address.is_empty());
        assert!(matches!(
            config.validate(),
            Err(LinkError::MissingDeviceAddress)
        ));
    }

    #[test]
    fn test_configured_target_validates() {
        let config = LinkConfig {
            device_address: "00:1d:a5:68:98:8b".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.target(), DeviceAddress::new("00:1D:A5:68:98:8B"));
    }
}
