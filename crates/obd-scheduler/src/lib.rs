//! Adaptive Telemetry Polling
//!
//! Polls RPM, throttle and speed over a [`obd_protocol::CommandSession`],
//! stretching the inter-command delay on failures, falling back to
//! single-PID requests when combined requests stall, and handing the ECU
//! back to verification once failures persist at the delay ceiling.

mod controller;
mod policy;

pub use controller::{CycleOutcome, PollerState, PollerStatus, PollingController};
pub use policy::{FailureVerdict, PollingConfig, PollingMode, PollingPolicy};
