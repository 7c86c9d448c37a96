//! OBD Bridge - Main Entry Point
//!
//! Usage: `obd-bridge [config.toml]` (or set `OBD_BRIDGE_CONFIG`)

use obd_bridge::{init_logging, BridgeConfig, ObdBridge};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("OBD_BRIDGE_CONFIG").ok());
    let config = BridgeConfig::load(path.as_deref())?;
    init_logging(&config.log)?;

    info!("=== OBD Bridge v{} ===", env!("CARGO_PKG_VERSION"));
    match &path {
        Some(path) => info!("Configuration loaded from {}", path),
        None => info!("No configuration file, using defaults"),
    }

    let bridge = ObdBridge::start(config).await?;
    tokio::signal::ctrl_c().await?;
    bridge.shutdown().await;
    Ok(())
}
