//! Simulated ELM327 BLE Adapter
//!
//! In-process [`Radio`] emulating a BLE ELM327 clone on the FFF0 service,
//! used for tests and hardware-free runs. It echoes until `ATE0`, answers
//! AT commands like the real firmware and synthesizes Mode 01 replies from
//! a configurable engine state.

use crate::error::LinkError;
use crate::gatt::bluetooth_uuid;
use crate::radio::{
    CharacteristicProperties, DeviceAddress, GattCharacteristic, GattService, Radio, RadioEvent,
    WriteMode,
};
use async_trait::async_trait;
use bytes::Bytes;
use obd_protocol::{data_length, FILLER_BYTE};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Radio calls recorded by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioOp {
    StartScan,
    StopScan,
    Connect(DeviceAddress),
    Disconnect,
    DiscoverServices,
    SetNotify(bool),
    Write(Vec<u8>),
    Reset,
}

/// Engine values reported over Mode 01
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineState {
    pub rpm: u32,
    /// Raw throttle byte (0-255)
    pub throttle_raw: u8,
    pub speed_kmh: u8,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            rpm: 820,
            throttle_raw: 0x24,
            speed_kmh: 0,
        }
    }
}

#[derive(Debug)]
struct SimState {
    advertising: bool,
    scanning: bool,
    connected: bool,
    notify_enabled: bool,
    echo: bool,
    protocol_found: bool,
    ecu_online: bool,
    responsive: bool,
    fail_connects: u32,
    hang_next_connect: bool,
    engine: EngineState,
    rx_line: Vec<u8>,
}

/// Emulated ELM327 behind a BLE UART service
pub struct SimulatedAdapter {
    address: DeviceAddress,
    events: mpsc::Sender<RadioEvent>,
    state: Mutex<SimState>,
    ops: Mutex<Vec<RadioOp>>,
    reply_delay: Duration,
    max_notification: usize,
}

impl SimulatedAdapter {
    /// Address the emulator advertises when none is configured
    pub const DEFAULT_ADDRESS: &'static str = "66:1E:87:02:64:C1";

    /// Create an adapter advertising as `address`, plus its event stream
    pub fn new(address: &str, queue: usize) -> (Arc<Self>, mpsc::Receiver<RadioEvent>) {
        let (events, rx) = mpsc::channel(queue.max(1));
        let adapter = Arc::new(Self {
            address: DeviceAddress::new(address),
            events,
            state: Mutex::new(SimState {
                advertising: true,
                scanning: false,
                connected: false,
                notify_enabled: false,
                echo: true,
                protocol_found: false,
                ecu_online: true,
                responsive: true,
                fail_connects: 0,
                hang_next_connect: false,
                engine: EngineState::default(),
                rx_line: Vec::new(),
            }),
            ops: Mutex::new(Vec::new()),
            reply_delay: Duration::from_millis(20),
            max_notification: 20,
        });
        (adapter, rx)
    }

    pub fn uart_service() -> u16 {
        0xFFF0
    }

    /// Recorded radio calls
    pub fn ops(&self) -> Vec<RadioOp> {
        self.ops.lock().clone()
    }

    /// Commands written since start, terminators stripped
    pub fn commands(&self) -> Vec<String> {
        let mut commands = Vec::new();
        let mut line = Vec::new();
        for op in self.ops.lock().iter() {
            if let RadioOp::Write(bytes) = op {
                for &b in bytes {
                    if b == b'\r' {
                        commands.push(String::from_utf8_lossy(&line).to_string());
                        line.clear();
                    } else {
                        line.push(b);
                    }
                }
            }
        }
        commands
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn set_advertising(&self, advertising: bool) {
        self.state.lock().advertising = advertising;
    }

    /// Vehicle ignition on/off as seen by the adapter
    pub fn set_ecu_online(&self, online: bool) {
        let mut state = self.state.lock();
        state.ecu_online = online;
        if !online {
            state.protocol_found = false;
        }
    }

    /// When false, commands are accepted but never answered
    pub fn set_responsive(&self, responsive: bool) {
        self.state.lock().responsive = responsive;
    }

    pub fn set_engine(&self, engine: EngineState) {
        self.state.lock().engine = engine;
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().fail_connects = count;
    }

    /// Let the next connection attempt hang until reset
    pub fn hang_next_connect(&self) {
        self.state.lock().hang_next_connect = true;
    }

    /// Drop the connection from the adapter side
    pub fn drop_link(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.notify_enabled = false;
            state.rx_line.clear();
        }
        info!("Simulated adapter dropping link: {}", reason);
        self.emit(RadioEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    fn record(&self, op: RadioOp) {
        self.ops.lock().push(op);
    }

    fn emit(&self, event: RadioEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("Simulated radio event dropped: {}", e);
        }
    }

    fn uart_characteristics() -> (GattCharacteristic, GattCharacteristic) {
        let service = bluetooth_uuid(Self::uart_service());
        let rx = GattCharacteristic {
            uuid: bluetooth_uuid(0xFFF1),
            service,
            properties: CharacteristicProperties {
                notify: true,
                ..Default::default()
            },
        };
        let tx = GattCharacteristic {
            uuid: bluetooth_uuid(0xFFF2),
            service,
            properties: CharacteristicProperties {
                write: true,
                write_without_response: true,
                ..Default::default()
            },
        };
        (rx, tx)
    }

    /// Build the full reply text for one command, prompt included
    fn respond(state: &mut SimState, command: &str) -> String {
        let mut out = String::new();
        if state.echo {
            out.push_str(command);
            out.push('\r');
        }

        let compact = command.to_ascii_uppercase().replace(' ', "");
        let body = match compact.as_str() {
            "ATZ" => {
                state.echo = true;
                state.protocol_found = false;
                "\rELM327 v1.5".to_string()
            }
            "ATE0" => {
                state.echo = false;
                "OK".to_string()
            }
            "ATE1" => {
                state.echo = true;
                "OK".to_string()
            }
            "ATRV" => "12.6V".to_string(),
            "ATDPN" => {
                if state.protocol_found {
                    "A6".to_string()
                } else {
                    "A0".to_string()
                }
            }
            cmd if cmd.starts_with("AT") => "OK".to_string(),
            cmd if cmd.starts_with("01") => Self::mode_01(state, &cmd[2..]),
            _ => "?".to_string(),
        };
        out.push_str(&body);
        out.push_str("\r\r>");
        out
    }

    fn mode_01(state: &mut SimState, pids: &str) -> String {
        if pids.is_empty() || pids.len() % 2 != 0 {
            return "?".to_string();
        }
        let mut requested = Vec::new();
        for i in (0..pids.len()).step_by(2) {
            match u8::from_str_radix(&pids[i..i + 2], 16) {
                Ok(pid) => requested.push(pid),
                Err(_) => return "?".to_string(),
            }
        }

        let searching = if state.protocol_found {
            ""
        } else {
            "SEARCHING...\r"
        };
        if !state.ecu_online {
            return format!("{}UNABLE TO CONNECT", searching);
        }
        state.protocol_found = true;

        let engine = state.engine;
        let mut payload = vec![0x41];
        for pid in requested {
            let data: Vec<u8> = match pid {
                0x00 => vec![0xBE, 0x3E, 0xB8, 0x11],
                0x0C => {
                    let raw = (engine.rpm * 4).min(u32::from(u16::MAX));
                    vec![(raw >> 8) as u8, (raw & 0xFF) as u8]
                }
                0x0D => vec![engine.speed_kmh],
                0x11 => vec![engine.throttle_raw],
                0x10 => vec![0x01, 0x90],
                _ => continue,
            };
            debug_assert_eq!(data.len(), data_length(pid));
            payload.push(pid);
            payload.extend(data);
        }
        if payload.len() == 1 {
            return format!("{}NO DATA", searching);
        }

        format!("{}{}", searching, Self::format_frames(&payload))
    }

    /// Single line up to 7 bytes, otherwise ISO-TP style multi-frame lines
    fn format_frames(payload: &[u8]) -> String {
        let hex = |bytes: &[u8]| {
            bytes
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ")
        };
        if payload.len() <= 7 {
            return hex(payload);
        }

        let mut lines = vec![format!("{:03X}", payload.len())];
        let (first, rest) = payload.split_at(6);
        lines.push(format!("0: {}", hex(first)));
        for (index, chunk) in rest.chunks(7).enumerate() {
            let mut frame = chunk.to_vec();
            frame.resize(7, FILLER_BYTE);
            lines.push(format!("{:X}: {}", (index + 1) % 16, hex(&frame)));
        }
        lines.join("\r")
    }

    fn deliver(&self, reply: String) {
        let chunks: Vec<Bytes> = reply
            .as_bytes()
            .chunks(self.max_notification)
            .map(Bytes::copy_from_slice)
            .collect();
        let events = self.events.clone();
        let delay = self.reply_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for chunk in chunks {
                if events.send(RadioEvent::Notification(chunk)).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl Radio for SimulatedAdapter {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn start_scan(&self) -> Result<(), LinkError> {
        self.record(RadioOp::StartScan);
        let advertising = {
            let mut state = self.state.lock();
            state.scanning = true;
            state.advertising
        };
        if advertising {
            self.emit(RadioEvent::DeviceDiscovered {
                address: self.address.clone(),
                name: Some("OBDII".to_string()),
            });
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.record(RadioOp::StopScan);
        self.state.lock().scanning = false;
        Ok(())
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<(), LinkError> {
        self.record(RadioOp::Connect(address.clone()));
        if *address != self.address {
            return Err(LinkError::UnknownDevice(address.to_string()));
        }

        let hang = {
            let mut state = self.state.lock();
            if state.scanning {
                return Err(LinkError::Radio("connect issued while scanning".into()));
            }
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(LinkError::Radio("connection refused".into()));
            }
            std::mem::take(&mut state.hang_next_connect)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        state.connected = true;
        state.notify_enabled = false;
        state.echo = true;
        state.rx_line.clear();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.record(RadioOp::Disconnect);
        let mut state = self.state.lock();
        state.connected = false;
        state.notify_enabled = false;
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, LinkError> {
        self.record(RadioOp::DiscoverServices);
        if !self.state.lock().connected {
            return Err(LinkError::NotReady);
        }
        let (rx, tx) = Self::uart_characteristics();
        Ok(vec![
            GattService {
                uuid: bluetooth_uuid(0x1800),
                characteristics: vec![],
            },
            GattService {
                uuid: bluetooth_uuid(Self::uart_service()),
                characteristics: vec![rx, tx],
            },
        ])
    }

    async fn set_notify(
        &self,
        _characteristic: &GattCharacteristic,
        enabled: bool,
    ) -> Result<(), LinkError> {
        self.record(RadioOp::SetNotify(enabled));
        let mut state = self.state.lock();
        if !state.connected {
            return Err(LinkError::NotReady);
        }
        state.notify_enabled = enabled;
        Ok(())
    }

    async fn write(
        &self,
        _characteristic: &GattCharacteristic,
        data: &[u8],
        _mode: WriteMode,
    ) -> Result<(), LinkError> {
        self.record(RadioOp::Write(data.to_vec()));
        let replies = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(LinkError::NotReady);
            }
            let mut replies = Vec::new();
            for &byte in data {
                if byte == b'\r' {
                    let command = String::from_utf8_lossy(&state.rx_line).trim().to_string();
                    state.rx_line.clear();
                    if command.is_empty() {
                        continue;
                    }
                    let reply = Self::respond(&mut state, &command);
                    if state.notify_enabled && state.responsive {
                        replies.push(reply);
                    }
                } else {
                    state.rx_line.push(byte);
                }
            }
            replies
        };
        for reply in replies {
            self.deliver(reply);
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), LinkError> {
        self.record(RadioOp::Reset);
        let mut state = self.state.lock();
        state.scanning = false;
        state.hang_next_connect = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::{ParsedEvent, ResponseParser, TelemetryValue};

    fn state() -> SimState {
        SimState {
            advertising: true,
            scanning: false,
            connected: true,
            notify_enabled: true,
            echo: false,
            protocol_found: true,
            ecu_online: true,
            responsive: true,
            fail_connects: 0,
            hang_next_connect: false,
            engine: EngineState {
                rpm: 1726,
                throttle_raw: 0x5A,
                speed_kmh: 60,
            },
            rx_line: Vec::new(),
        }
    }

    fn values(reply: &str) -> Vec<TelemetryValue> {
        let mut parser = ResponseParser::default();
        parser
            .feed(reply.as_bytes())
            .into_iter()
            .filter_map(|e| match e {
                ParsedEvent::Frame(f) => Some(f.values().collect::<Vec<_>>()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_echo_until_ate0() {
        let mut s = state();
        s.echo = true;
        assert_eq!(SimulatedAdapter::respond(&mut s, "ATE0"), "ATE0\rOK\r\r>");
        assert_eq!(SimulatedAdapter::respond(&mut s, "ATH0"), "OK\r\r>");
    }

    #[test]
    fn test_single_frame_reply() {
        let mut s = state();
        assert_eq!(SimulatedAdapter::respond(&mut s, "010D"), "41 0D 3C\r\r>");
    }

    #[test]
    fn test_combined_reply_is_multi_frame_and_parses() {
        let mut s = state();
        let reply = SimulatedAdapter::respond(&mut s, "010C110D");
        assert!(reply.starts_with("008\r0: 41 0C 1A F8 11 5A\r1: 0D 3C 55"));
        assert_eq!(
            values(&reply),
            vec![
                TelemetryValue::Rpm(1726),
                TelemetryValue::ThrottlePct(35),
                TelemetryValue::SpeedKmh(60),
            ]
        );
    }

    #[test]
    fn test_first_request_searches() {
        let mut s = state();
        s.protocol_found = false;
        let reply = SimulatedAdapter::respond(&mut s, "0100");
        assert_eq!(reply, "SEARCHING...\r41 00 BE 3E B8 11\r\r>");
        assert_eq!(SimulatedAdapter::respond(&mut s, "AT DPN"), "A6\r\r>");
    }

    #[test]
    fn test_offline_ecu() {
        let mut s = state();
        s.ecu_online = false;
        assert_eq!(SimulatedAdapter::respond(&mut s, "010C"), "UNABLE TO CONNECT\r\r>");
        assert_eq!(SimulatedAdapter::respond(&mut s, "XYZ"), "?\r\r>");
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_delivers_chunked_notifications() {
        let (adapter, mut events) = SimulatedAdapter::new(SimulatedAdapter::DEFAULT_ADDRESS, 64);
        let target = DeviceAddress::new(SimulatedAdapter::DEFAULT_ADDRESS);
        adapter.connect(&target).await.unwrap();
        let (rx, tx) = SimulatedAdapter::uart_characteristics();
        adapter.set_notify(&rx, true).await.unwrap();
        adapter
            .write(&tx, b"ATZ\r", WriteMode::WithoutResponse)
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Some(RadioEvent::Notification(chunk)) = events.recv().await {
            assert!(chunk.len() <= 20);
            received.extend_from_slice(&chunk);
            if received.ends_with(b">") {
                break;
            }
        }
        assert_eq!(received, b"ATZ\r\rELM327 v1.5\r\r>".to_vec());
        assert_eq!(adapter.commands(), vec!["ATZ"]);
    }

    #[tokio::test]
    async fn test_connect_rejected_while_scanning() {
        let (adapter, _events) = SimulatedAdapter::new(SimulatedAdapter::DEFAULT_ADDRESS, 8);
        adapter.start_scan().await.unwrap();
        let target = DeviceAddress::new(SimulatedAdapter::DEFAULT_ADDRESS);
        assert!(adapter.connect(&target).await.is_err());
        adapter.stop_scan().await.unwrap();
        assert!(adapter.connect(&target).await.is_ok());
    }
}
