//! OBD-II PID Definitions and Value Decoding
//!
//! Mode 01 PIDs this core requests and the integer formulas used to turn
//! their data bytes into telemetry.

use serde::{Deserialize, Serialize};

/// Padding byte CAN adapters append after the last PID of a frame
pub const FILLER_BYTE: u8 = 0x55;

/// Mode 01 PIDs known to this core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Supported PIDs 01-20 bitmap (0x00)
    SupportedPids = 0x00,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
}

impl Pid {
    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Look up a known PID by its code
    pub fn from_code(code: u8) -> Option<Pid> {
        match code {
            0x00 => Some(Pid::SupportedPids),
            0x0C => Some(Pid::Rpm),
            0x0D => Some(Pid::Speed),
            0x11 => Some(Pid::ThrottlePosition),
            _ => None,
        }
    }

    /// Single-PID Mode 01 request text, e.g. `010C`
    pub fn request(&self) -> String {
        format!("01{:02X}", self.as_hex())
    }

    /// Multi-PID Mode 01 request text, e.g. `010C110D`
    pub fn combined_request(pids: &[Pid]) -> String {
        pids.iter().fold("01".to_string(), |mut text, pid| {
            text.push_str(&format!("{:02X}", pid.as_hex()));
            text
        })
    }
}

/// Number of data bytes following `pid` in a Mode 01 reply.
///
/// Unknown PIDs are assumed to carry one byte so a multi-PID frame can be
/// walked past them.
pub fn data_length(pid: u8) -> usize {
    match pid {
        // supported-PID bitmaps
        0x00 | 0x20 | 0x40 | 0x60 | 0x80 | 0xA0 | 0xC0 => 4,
        // RPM, MAF
        0x0C | 0x10 => 2,
        _ => 1,
    }
}

/// RPM: ((A*256)+B)/4
pub fn decode_rpm(a: u8, b: u8) -> u32 {
    (u32::from(a) * 256 + u32::from(b)) / 4
}

/// Speed: A (km/h)
pub fn decode_speed(a: u8) -> u8 {
    a
}

/// Throttle position: A*100/255 (%)
pub fn decode_throttle(a: u8) -> u8 {
    let pct = (u16::from(a) * 100) / 255;
    pct.min(100) as u8
}

/// A telemetry value decoded from one PID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryValue {
    Rpm(u32),
    ThrottlePct(u8),
    SpeedKmh(u8),
}

/// One PID and its data bytes as they appeared in a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidReading {
    /// PID code
    pub pid: u8,
    /// Data bytes, exactly `data_length(pid)` long
    pub data: Vec<u8>,
}

impl PidReading {
    /// Decode into a telemetry value when the PID is one we track
    pub fn value(&self) -> Option<TelemetryValue> {
        match (Pid::from_code(self.pid)?, self.data.as_slice()) {
            (Pid::Rpm, [a, b]) => Some(TelemetryValue::Rpm(decode_rpm(*a, *b))),
            (Pid::Speed, [a]) => Some(TelemetryValue::SpeedKmh(decode_speed(*a))),
            (Pid::ThrottlePosition, [a]) => {
                Some(TelemetryValue::ThrottlePct(decode_throttle(*a)))
            }
            _ => None,
        }
    }
}
