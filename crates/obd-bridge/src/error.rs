//! Bridge Error Types

use obd_link::LinkError;
use thiserror::Error;

/// Startup failures; nothing after startup is fatal
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration could not be read or deserialized
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Radio back-end could not be opened
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Transport compiled out of this build
    #[error("Transport '{0}' not enabled in this build")]
    UnsupportedTransport(&'static str),

    /// Unknown log level name
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    /// A global tracing subscriber was already installed
    #[error("Logging initialization failed: {0}")]
    Logging(String),
}
