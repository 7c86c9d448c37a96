//! Bridge configuration
//!
//! Every section is optional; missing keys fall back to the component
//! defaults. Environment variables override file values using
//! `OBD_BRIDGE__<SECTION>__<KEY>`, e.g. `OBD_BRIDGE__LINK__DEVICE_ADDRESS`.

use crate::error::BridgeError;
use config::{Config, Environment, File, FileFormat};
use obd_link::LinkConfig;
use obd_protocol::{SessionConfig, VerifierConfig};
use obd_scheduler::PollingConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "OBD_BRIDGE";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Maximum level: trace, debug, info, warn or error
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Radio back-end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process ELM327 emulator
    #[default]
    Simulated,
    /// BLE adapter (feature `ble`)
    Ble,
    /// SPP or USB serial port (feature `serial`)
    Serial,
}

/// Serial port settings for [`TransportKind::Serial`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path; also used as the link target address
    pub path: String,
    /// Baud rate
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/rfcomm0".to_string(),
            baud_rate: 38400,
        }
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub log: LogConfig,
    pub transport: TransportKind,
    pub serial: SerialConfig,
    pub link: LinkConfig,
    pub session: SessionConfig,
    pub verifier: VerifierConfig,
    pub polling: PollingConfig,
    pub status: StatusConfig,
}

/// Periodic status line and the external mode toggle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Interval of the vehicle status log line (milliseconds, 0 disables)
    pub log_interval_ms: u64,
    /// Initial state of the manual/automatic toggle
    pub auto_mode: bool,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            log_interval_ms: 1000,
            auto_mode: true,
        }
    }
}

impl StatusConfig {
    pub fn log_interval(&self) -> Option<Duration> {
        (self.log_interval_ms > 0).then(|| Duration::from_millis(self.log_interval_ms))
    }
}

impl BridgeConfig {
    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&str>) -> Result<Self, BridgeError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).format(FileFormat::Toml));
        }
        Self::finish(builder)
    }

    /// Parse TOML text, then apply environment overrides
    pub fn from_toml_str(text: &str) -> Result<Self, BridgeError> {
        Self::finish(Config::builder().add_source(File::from_str(text, FileFormat::Toml)))
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, BridgeError> {
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let mut config: BridgeConfig = settings.try_deserialize()?;
        if config.transport == TransportKind::Serial {
            config.link.device_address = config.serial.path.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_link::DeviceAddress;
    use obd_protocol::ObdProtocol;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config.transport, TransportKind::Simulated);
        assert_eq!(config.log.level, "info");
        assert!(config.link.device_address.is_empty());
        assert_eq!(config.session.prompt_timeout_ms, 2000);
        assert_eq!(config.verifier.max_attempts, 10);
        assert_eq!(config.polling.min_delay_ms, 175);
        assert_eq!(config.polling.max_delay_ms, 500);
        assert_eq!(config.status.log_interval_ms, 1000);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [log]
            level = "debug"
            json = true

            [link]
            device_address = "aa-bb-cc-dd-ee-ff"
            notify_quirk = false

            [session]
            protocol = "j1850_pwm"

            [polling]
            max_delay_ms = 800
            "#,
        )
        .unwrap();
        assert!(config.log.json);
        assert_eq!(config.log.level, "debug");
        assert!(!config.link.notify_quirk);
        assert_eq!(config.link.target(), DeviceAddress::new("AA:BB:CC:DD:EE:FF"));
        assert_eq!(config.session.protocol, ObdProtocol::J1850Pwm);
        assert_eq!(config.polling.max_delay_ms, 800);
        assert_eq!(config.polling.min_delay_ms, 175);
    }

    #[test]
    fn test_serial_transport_targets_port_path() {
        let config = BridgeConfig::from_toml_str(
            r#"
            transport = "serial"

            [serial]
            path = "/dev/ttyUSB0"
            "#,
        )
        .unwrap();
        assert_eq!(config.transport, TransportKind::Serial);
        assert_eq!(config.link.device_address, "/dev/ttyUSB0");
    }

    #[test]
    fn test_example_file_parses() {
        let config = BridgeConfig::from_toml_str(include_str!("../obd-bridge.toml")).unwrap();
        assert_eq!(config.link.uart_candidates.len(), 4);
        assert_eq!(config.status.log_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_unknown_transport_rejected() {
        assert!(BridgeConfig::from_toml_str("transport = \"carrier-pigeon\"").is_err());
    }
}
