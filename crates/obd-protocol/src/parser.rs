//! ELM327 Reply Parsing
//!
//! Three stages turn the inbound byte stream into events:
//!
//! 1. [`LineFramer`] splits bytes into CR-terminated lines and spots the
//!    `>` prompt.
//! 2. [`classify`] separates control replies (`OK`, `NO DATA`, ...) from
//!    candidate data lines.
//! 3. [`FrameDecoder`] reassembles multi-frame CAN replies and walks the
//!    Mode 01 PID stream.

use crate::error::AdapterFault;
use crate::pid::{data_length, PidReading, TelemetryValue, FILLER_BYTE};
use std::fmt;
use tracing::debug;

/// Mode 01 positive response byte
pub const MODE_01_RESPONSE: u8 = 0x41;

/// Default limit for an unterminated line
pub const DEFAULT_MAX_LINE: usize = 256;

/// Output of the line framer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramedItem {
    /// A complete, non-empty line without its terminator
    Line(String),
    /// Adapter prompt `>`: ready for the next command
    Prompt,
    /// Line exceeded the buffer and was discarded
    Overflow(usize),
}

/// Splits the inbound byte stream into lines
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line: usize,
    /// Rest of an overflowed line is dropped up to its terminator
    discarding: bool,
}

impl LineFramer {
    /// Create a framer that discards lines longer than `max_line`
    pub fn new(max_line: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_line),
            max_line: max_line.max(1),
            discarding: false,
        }
    }

    /// Push received bytes, returning completed items in arrival order
    pub fn push(&mut self, bytes: &[u8]) -> Vec<FramedItem> {
        let mut items = Vec::new();
        for &byte in bytes {
            match byte {
                b'\r' => {
                    self.discarding = false;
                    self.complete_line(&mut items);
                }
                b'\n' => {}
                b'>' => {
                    self.discarding = false;
                    self.complete_line(&mut items);
                    items.push(FramedItem::Prompt);
                }
                32..=126 if self.discarding => {}
                32..=126 => {
                    if self.buffer.len() >= self.max_line {
                        items.push(FramedItem::Overflow(self.buffer.len()));
                        self.buffer.clear();
                        self.discarding = true;
                        continue;
                    }
                    self.buffer.push(byte);
                }
                other => debug!("Dropping unexpected byte 0x{:02X}", other),
            }
        }
        items
    }

    /// Discard any partial line
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    fn complete_line(&mut self, items: &mut Vec<FramedItem>) {
        if self.buffer.is_empty() {
            return;
        }
        // only printable ASCII is ever buffered
        let line = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        if !line.is_empty() {
            items.push(FramedItem::Line(line));
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

/// A classified non-data reply line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Identification banner such as `ELM327 v1.5`
    Identification(String),
    /// `OK`
    Ok,
    /// `SEARCHING...`
    Searching,
    /// Failure string in place of data
    Fault(AdapterFault),
    /// Informational replies (`STOPPED`, `BUS INIT`, voltage, ...)
    Info(String),
}

impl Response {
    /// Failure carried by this reply, if any
    pub fn fault(&self) -> Option<AdapterFault> {
        match self {
            Response::Fault(fault) => Some(*fault),
            _ => None,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Identification(text) | Response::Info(text) => f.write_str(text),
            Response::Ok => f.write_str("OK"),
            Response::Searching => f.write_str("SEARCHING..."),
            Response::Fault(fault) => write!(f, "{}", fault),
        }
    }
}

/// Result of classifying a single line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    /// Control reply, never parsed as data
    Control(Response),
    /// Candidate Mode 01 data line
    Data(String),
}

/// Classify a completed line
pub fn classify(line: &str) -> LineClass {
    let upper = line.trim().to_ascii_uppercase();
    let control = if upper.contains("ELM327") {
        Response::Identification(line.trim().to_string())
    } else if upper == "OK" {
        Response::Ok
    } else if upper.contains("CAN ERROR") {
        Response::Fault(AdapterFault::CanError)
    } else if upper.contains("NO DATA") {
        Response::Fault(AdapterFault::NoData)
    } else if upper.contains("UNABLE TO CONNECT") {
        Response::Fault(AdapterFault::UnableToConnect)
    } else if upper.contains("ERROR") || upper == "?" {
        Response::Fault(AdapterFault::Rejected)
    } else if upper.starts_with("SEARCHING") {
        Response::Searching
    } else if upper.starts_with("STOPPED") || upper.starts_with("BUS INIT") {
        Response::Info(line.trim().to_string())
    } else {
        return LineClass::Data(line.trim().to_string());
    };
    LineClass::Control(control)
}

/// PIDs decoded from one Mode 01 reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Complete PID readings in reply order
    pub readings: Vec<PidReading>,
    /// A trailing PID was cut short and dropped
    pub truncated: bool,
}

impl DecodedFrame {
    /// Telemetry values carried by the frame
    pub fn values(&self) -> impl Iterator<Item = TelemetryValue> + '_ {
        self.readings.iter().filter_map(PidReading::value)
    }

    /// Whether the frame answers `pid`
    pub fn contains_pid(&self, pid: u8) -> bool {
        self.readings.iter().any(|r| r.pid == pid)
    }
}

/// Outcome of handing one line to the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStep {
    /// A full frame was decoded
    Frame(DecodedFrame),
    /// Part of a multi-frame reply, waiting for more lines
    Pending,
    /// Not a Mode 01 reply (voltage, protocol number, echo, ...)
    NotMode01(String),
    /// Looked like data but could not be decoded
    Malformed(String),
}

/// Reassembles and decodes Mode 01 replies
#[derive(Debug, Default)]
pub struct FrameDecoder {
    expected: Option<usize>,
    assembled: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one data line
    pub fn push_line(&mut self, line: &str) -> DecodeStep {
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return DecodeStep::NotMode01(line.to_string());
        }

        // byte-count line announcing a multi-frame reply
        if compact.len() == 3 && compact.chars().all(|c| c.is_ascii_hexdigit()) {
            return match usize::from_str_radix(&compact, 16) {
                Ok(count) => {
                    self.expected = Some(count);
                    self.assembled.clear();
                    DecodeStep::Pending
                }
                Err(_) => DecodeStep::NotMode01(line.to_string()),
            };
        }

        if let Some((index, payload)) = compact.split_once(':') {
            if index.is_empty() || !index.chars().all(|c| c.is_ascii_hexdigit()) {
                self.reset();
                return DecodeStep::Malformed(line.to_string());
            }
            let bytes = match parse_hex(payload) {
                Some(bytes) => bytes,
                None => {
                    self.reset();
                    return DecodeStep::Malformed(line.to_string());
                }
            };
            return match self.expected {
                Some(count) => {
                    self.assembled.extend_from_slice(&bytes);
                    if self.assembled.len() >= count {
                        let mut payload = std::mem::take(&mut self.assembled);
                        payload.truncate(count);
                        self.expected = None;
                        decode_payload(&payload, line)
                    } else {
                        DecodeStep::Pending
                    }
                }
                None => decode_payload(&bytes, line),
            };
        }

        // a plain line ends any half-assembled reply
        self.reset();
        match parse_hex(&compact) {
            Some(bytes) => decode_payload(&bytes, line),
            None => DecodeStep::NotMode01(line.to_string()),
        }
    }

    /// Decode whatever was assembled when the reply ends early (prompt seen)
    pub fn flush(&mut self) -> Option<DecodeStep> {
        let expected = self.expected.take()?;
        let payload = std::mem::take(&mut self.assembled);
        if payload.is_empty() {
            return None;
        }
        debug!(
            "Multi-frame reply ended after {} of {} bytes",
            payload.len(),
            expected
        );
        Some(decode_payload(&payload, "<partial multi-frame reply>"))
    }

    /// Drop any partial multi-frame state
    pub fn reset(&mut self) {
        self.expected = None;
        self.assembled.clear();
    }
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    if text.is_empty() || text.len() % 2 != 0 {
        return None;
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

fn decode_payload(bytes: &[u8], line: &str) -> DecodeStep {
    if bytes.first() != Some(&MODE_01_RESPONSE) {
        return DecodeStep::NotMode01(line.to_string());
    }

    let mut frame = DecodedFrame::default();
    let mut pos = 1;
    while pos < bytes.len() {
        let pid = bytes[pos];
        if pid == FILLER_BYTE {
            break;
        }
        let len = data_length(pid);
        let end = pos + 1 + len;
        if end > bytes.len() {
            frame.truncated = true;
            break;
        }
        frame.readings.push(PidReading {
            pid,
            data: bytes[pos + 1..end].to_vec(),
        });
        pos = end;
    }

    if frame.readings.is_empty() {
        DecodeStep::Malformed(line.to_string())
    } else {
        DecodeStep::Frame(frame)
    }
}

/// Event produced by [`ResponseParser::feed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    /// Control or informational reply
    Reply(Response),
    /// Decoded Mode 01 frame
    Frame(DecodedFrame),
    /// Adapter prompt
    Prompt,
    /// Receive buffer overflowed and was cleared
    Overflow(usize),
}

/// Full inbound pipeline: framing, classification and frame decoding
#[derive(Debug)]
pub struct ResponseParser {
    framer: LineFramer,
    decoder: FrameDecoder,
}

impl ResponseParser {
    pub fn new(max_line: usize) -> Self {
        Self {
            framer: LineFramer::new(max_line),
            decoder: FrameDecoder::new(),
        }
    }

    /// Feed inbound bytes in arrival order
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ParsedEvent> {
        let mut events = Vec::new();
        for item in self.framer.push(bytes) {
            match item {
                FramedItem::Line(line) => self.handle_line(&line, &mut events),
                FramedItem::Prompt => {
                    if let Some(step) = self.decoder.flush() {
                        Self::handle_step(step, &mut events);
                    }
                    events.push(ParsedEvent::Prompt);
                }
                FramedItem::Overflow(len) => {
                    self.decoder.reset();
                    events.push(ParsedEvent::Overflow(len));
                }
            }
        }
        events
    }

    /// Forget partial lines and frames
    pub fn reset(&mut self) {
        self.framer.reset();
        self.decoder.reset();
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<ParsedEvent>) {
        match classify(line) {
            LineClass::Control(response) => {
                self.decoder.reset();
                events.push(ParsedEvent::Reply(response));
            }
            LineClass::Data(data) => {
                let step = self.decoder.push_line(&data);
                Self::handle_step(step, events);
            }
        }
    }

    fn handle_step(step: DecodeStep, events: &mut Vec<ParsedEvent>) {
        match step {
            DecodeStep::Frame(frame) => events.push(ParsedEvent::Frame(frame)),
            DecodeStep::Pending => {}
            DecodeStep::NotMode01(line) => events.push(ParsedEvent::Reply(Response::Info(line))),
            DecodeStep::Malformed(line) => debug!("Dropping malformed frame: {}", line),
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}
