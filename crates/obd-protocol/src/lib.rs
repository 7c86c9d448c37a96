//! ELM327 / OBD-II Protocol Core
//!
//! This crate drives an ELM327-compatible adapter over an abstract byte
//! transport: it paces AT/OBD commands against the adapter prompt, parses
//! multi-PID Mode 01 replies into telemetry and verifies that the vehicle
//! ECU is answering.

mod error;
mod parser;
mod pid;
mod protocol;
mod session;
mod status;
mod telemetry;
mod transport;
mod verifier;

pub use error::{AdapterFault, ObdError};
pub use parser::{
    classify, DecodeStep, DecodedFrame, FrameDecoder, FramedItem, LineClass, LineFramer,
    ParsedEvent, Response, ResponseParser, DEFAULT_MAX_LINE,
};
pub use pid::{
    data_length, decode_rpm, decode_speed, decode_throttle, Pid, PidReading, TelemetryValue,
    FILLER_BYTE,
};
pub use protocol::ObdProtocol;
pub use session::{
    CommandSession, Exchange, InitStep, Pacing, PendingCommand, Reply, SessionConfig,
    SessionEvent, SessionState,
};
pub use status::{ConnectionState, EcuStatus, LinkSnapshot};
pub use telemetry::{TelemetryField, TelemetrySnapshot, TelemetryStore};
pub use transport::{LinkListener, Transport};
pub use verifier::{EcuVerifier, ProbeOutcome, VerifierConfig, PROBE_COMMAND};
