//! OBD Telemetry Bridge
//!
//! Wires a radio back-end, the link lifecycle manager, the command session
//! and the polling controller together, and exports live telemetry and
//! connection status to outer layers (web UI, indicators, actuators).

mod config;
mod error;

pub use crate::config::{
    BridgeConfig, LogConfig, SerialConfig, StatusConfig, TransportKind, ENV_PREFIX,
};
pub use error::BridgeError;

use obd_link::{LinkManager, LinkWriter, Radio, RadioEvent, SimulatedAdapter, UartSlot};
use obd_protocol::{
    CommandSession, ConnectionState, EcuStatus, LinkSnapshot, TelemetrySnapshot, TelemetryStore,
};
use obd_scheduler::{PollerStatus, PollingController, PollingMode};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Connection status exported to outer layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Adapter link is up and subscribed
    pub radio_connected: bool,
    /// Vehicle ECU answers Mode 01 requests
    pub ecu_connected: bool,
    /// Polling fell back to single-PID requests
    pub degraded: bool,
    pub link_state: ConnectionState,
}

/// Initialize the global tracing subscriber
pub fn init_logging(config: &LogConfig) -> Result<(), BridgeError> {
    let level: Level = config
        .level
        .parse()
        .map_err(|_| BridgeError::InvalidLogLevel(config.level.clone()))?;

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);
    let result = if config.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    result.map_err(|e| BridgeError::Logging(e.to_string()))
}

/// State shared with the background tasks
struct Shared {
    session: Arc<CommandSession>,
    link: watch::Receiver<LinkSnapshot>,
    poller: watch::Receiver<PollerStatus>,
    auto_mode: AtomicBool,
}

impl Shared {
    /// Telemetry with fields older than the active mode allows read as zero
    fn telemetry(&self) -> TelemetrySnapshot {
        let freshness = self.poller.borrow().freshness();
        self.session
            .telemetry()
            .snapshot_fresh(Instant::now(), freshness)
    }

    fn connection_status(&self) -> ConnectionStatus {
        let link = *self.link.borrow();
        ConnectionStatus {
            radio_connected: link.is_ready(),
            ecu_connected: self.session.ecu().is_connected(),
            degraded: self.poller.borrow().mode == PollingMode::IndividualPid,
            link_state: link.state,
        }
    }

    fn log_status(&self) {
        let telemetry = self.telemetry();
        let status = self.connection_status();
        let mode = if self.auto_mode.load(Ordering::Relaxed) {
            "AUTO"
        } else {
            "MANUAL"
        };
        info!(
            "RPM: {} | Throttle: {}% | Speed: {} km/h | BT: {} | ECU: {} | Polling: {:?} | Mode: {}",
            telemetry.rpm,
            telemetry.throttle_pct,
            telemetry.speed_kmh,
            if status.radio_connected { "OK" } else { "NO" },
            if status.ecu_connected { "OK" } else { "NO" },
            self.poller.borrow().mode,
            mode
        );
    }
}

/// Running bridge: background tasks plus the export interface
pub struct ObdBridge {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ObdBridge {
    /// Open the configured radio back-end and start all tasks
    pub async fn start(mut config: BridgeConfig) -> Result<Self, BridgeError> {
        match config.transport {
            TransportKind::Simulated => {
                if config.link.device_address.trim().is_empty() {
                    config.link.device_address = SimulatedAdapter::DEFAULT_ADDRESS.to_string();
                }
                let (radio, events) =
                    SimulatedAdapter::new(&config.link.device_address, config.link.event_queue);
                info!("Using simulated ELM327 adapter");
                Ok(Self::start_with_radio(radio, events, config))
            }
            TransportKind::Ble => {
                config.link.validate()?;
                Self::start_ble(config).await
            }
            TransportKind::Serial => {
                config.link.validate()?;
                Self::start_serial(config)
            }
        }
    }

    #[cfg(feature = "ble")]
    async fn start_ble(config: BridgeConfig) -> Result<Self, BridgeError> {
        let (tx, events) = mpsc::channel(config.link.event_queue.max(1));
        let radio = Arc::new(obd_link::BleRadio::new(tx).await?);
        Ok(Self::start_with_radio(radio, events, config))
    }

    #[cfg(not(feature = "ble"))]
    async fn start_ble(_config: BridgeConfig) -> Result<Self, BridgeError> {
        Err(BridgeError::UnsupportedTransport("ble"))
    }

    #[cfg(feature = "serial")]
    fn start_serial(config: BridgeConfig) -> Result<Self, BridgeError> {
        let (tx, events) = mpsc::channel(config.link.event_queue.max(1));
        let radio = Arc::new(obd_link::SerialRadio::new(
            config.serial.path.clone(),
            config.serial.baud_rate,
            tx,
        ));
        Ok(Self::start_with_radio(radio, events, config))
    }

    #[cfg(not(feature = "serial"))]
    fn start_serial(_config: BridgeConfig) -> Result<Self, BridgeError> {
        Err(BridgeError::UnsupportedTransport("serial"))
    }

    /// Start all tasks over an already opened radio
    pub fn start_with_radio(
        radio: Arc<dyn Radio>,
        events: mpsc::Receiver<RadioEvent>,
        config: BridgeConfig,
    ) -> Self {
        info!(
            "Starting OBD bridge on {} for {}",
            radio.name(),
            config.link.device_address
        );
        let slot = UartSlot::default();
        let writer = Arc::new(LinkWriter::new(
            radio.clone(),
            slot.clone(),
            config.link.max_write_chunk,
        ));
        let session = Arc::new(CommandSession::new(
            writer,
            Arc::new(TelemetryStore::new()),
            Arc::new(EcuStatus::new()),
            config.session,
        ));

        let manager = LinkManager::new(radio, events, session.clone(), slot, config.link);
        let link = manager.subscribe();
        let controller = PollingController::new(
            session.clone(),
            link.clone(),
            config.verifier,
            config.polling,
        );
        let poller = controller.subscribe();

        let shared = Arc::new(Shared {
            session,
            link,
            poller,
            auto_mode: AtomicBool::new(config.status.auto_mode),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![
            tokio::spawn(manager.run(shutdown_rx.clone())),
            tokio::spawn(controller.run(shutdown_rx.clone())),
        ];
        if let Some(interval) = config.status.log_interval() {
            tasks.push(tokio::spawn(status_logger(
                shared.clone(),
                interval,
                shutdown_rx,
            )));
        }

        Self {
            shared,
            shutdown,
            tasks,
        }
    }

    /// Latest telemetry; stale fields read as zero
    pub fn current_telemetry(&self) -> TelemetrySnapshot {
        self.shared.telemetry()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.connection_status()
    }

    /// Telemetry and connection status as one JSON document
    pub fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "telemetry": self.current_telemetry(),
            "connection": self.connection_status(),
            "auto_mode": self.auto_mode(),
        })
    }

    /// Watch the link lifecycle state
    pub fn link_status(&self) -> watch::Receiver<LinkSnapshot> {
        self.shared.link.clone()
    }

    /// Watch the polling controller
    pub fn poller_status(&self) -> watch::Receiver<PollerStatus> {
        self.shared.poller.clone()
    }

    /// Manual/automatic toggle, stored for outer layers only
    pub fn auto_mode(&self) -> bool {
        self.shared.auto_mode.load(Ordering::Relaxed)
    }

    pub fn set_auto_mode(&self, auto: bool) {
        let previous = self.shared.auto_mode.swap(auto, Ordering::Relaxed);
        if previous != auto {
            info!("Mode set to {}", if auto { "AUTO" } else { "MANUAL" });
        }
    }

    /// Flip the toggle, returning the new value
    pub fn toggle_mode(&self) -> bool {
        let auto = !self.shared.auto_mode.fetch_xor(true, Ordering::Relaxed);
        info!("Mode toggled to {}", if auto { "AUTO" } else { "MANUAL" });
        auto
    }

    /// Log the one-line vehicle status
    pub fn log_status(&self) {
        self.shared.log_status();
    }

    /// Stop all tasks and disconnect from the adapter
    pub async fn shutdown(self) {
        info!("Shutting down OBD bridge");
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Bridge task ended abnormally: {}", e);
            }
        }
    }
}

async fn status_logger(
    shared: Arc<Shared>,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => shared.log_status(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.status.log_interval_ms = 0;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_toggle() {
        let bridge = ObdBridge::start(quiet_config()).await.unwrap();
        assert!(bridge.auto_mode());
        assert!(!bridge.toggle_mode());
        assert!(!bridge.auto_mode());
        bridge.set_auto_mode(true);
        assert!(bridge.auto_mode());
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_before_connection() {
        let bridge = ObdBridge::start(quiet_config()).await.unwrap();
        let status = bridge.connection_status();
        assert!(!status.ecu_connected);
        assert!(!status.degraded);
        assert_eq!(bridge.current_telemetry(), TelemetrySnapshot::default());

        let json = bridge.status_json();
        assert_eq!(json["telemetry"]["rpm"], 0);
        assert_eq!(json["connection"]["ecu_connected"], false);
        assert_eq!(json["auto_mode"], true);
        bridge.shutdown().await;
    }

    #[test]
    fn test_invalid_log_level() {
        let config = LogConfig {
            level: "loud".to_string(),
            json: false,
        };
        assert!(matches!(
            init_logging(&config),
            Err(BridgeError::InvalidLogLevel(_))
        ));
    }

    #[tokio::test]
    async fn test_real_radios_need_an_address() {
        for transport in [TransportKind::Ble, TransportKind::Serial] {
            let mut config = quiet_config();
            config.transport = transport;
            config.serial.path.clear();
            assert!(matches!(
                ObdBridge::start(config).await,
                Err(BridgeError::Link(obd_link::LinkError::MissingDeviceAddress))
            ));
        }
    }

    #[cfg(not(feature = "ble"))]
    #[tokio::test]
    async fn test_ble_requires_feature() {
        let mut config = quiet_config();
        config.transport = TransportKind::Ble;
        config.link.device_address = "00:1D:A5:68:98:8B".to_string();
        assert!(matches!(
            ObdBridge::start(config).await,
            Err(BridgeError::UnsupportedTransport("ble"))
        ));
    }
}
