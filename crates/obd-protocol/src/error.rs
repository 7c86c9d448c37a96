//! OBD-II Error Types

use std::fmt;
use thiserror::Error;

/// Failure replies an ELM327 sends in place of data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterFault {
    /// `NO DATA`: the ECU did not answer within the adapter timeout
    NoData,
    /// `CAN ERROR`: bus level failure
    CanError,
    /// `UNABLE TO CONNECT`: the adapter answers but no ECU protocol was found
    UnableToConnect,
    /// `ERROR` or `?`: the adapter rejected the command
    Rejected,
}

impl fmt::Display for AdapterFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AdapterFault::NoData => "NO DATA",
            AdapterFault::CanError => "CAN ERROR",
            AdapterFault::UnableToConnect => "UNABLE TO CONNECT",
            AdapterFault::Rejected => "command rejected",
        };
        f.write_str(text)
    }
}

/// Errors that can occur during OBD-II communication
#[derive(Debug, Error)]
pub enum ObdError {
    /// Write to the radio link failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timeout waiting for a prompt or response
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// Adapter answered with a failure string
    #[error("Adapter reported {0}")]
    Adapter(AdapterFault),

    /// Payload could not be decoded as a Mode 01 frame
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Unterminated line outgrew the receive buffer
    #[error("Receive buffer overflow after {0} bytes")]
    BufferOverflow(usize),

    /// No radio link to the adapter
    #[error("OBD adapter not connected")]
    NotConnected,

    /// The connection this wait belonged to has been replaced
    #[error("Connection generation {0} was superseded")]
    Cancelled(u64),
}

impl ObdError {
    /// True when the error means the link went away rather than the ECU misbehaving
    pub fn is_link_loss(&self) -> bool {
        matches!(self, ObdError::NotConnected | ObdError::Cancelled(_))
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}
