//! Serial radio back-end for Classic Bluetooth SPP adapters
//!
//! An RFCOMM-bound SPP adapter (e.g. `/dev/rfcomm0`) or a USB ELM327 is a
//! plain byte stream. It is exposed as a single synthetic UART service so
//! the lifecycle manager treats it exactly like a BLE adapter.
//!
//! # Requirements
//!
//! Enable the `serial` feature. On Linux:
//! ```bash
//! apt install libudev-dev pkg-config
//! ```

use crate::error::LinkError;
use crate::gatt::bluetooth_uuid;
use crate::radio::{
    CharacteristicProperties, DeviceAddress, GattCharacteristic, GattService, Radio, RadioEvent,
    WriteMode,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Buffer size for reading from the serial port
const READ_BUFFER_SIZE: usize = 256;

/// Serial Port Profile
const SPP_SERVICE: u16 = 0x1101;

/// Serial port presented as a one-characteristic UART service
pub struct SerialRadio {
    /// Port path, also the device address
    path: String,
    /// Baud rate
    baud_rate: u32,
    events: mpsc::Sender<RadioEvent>,
    /// Write half while open
    writer: tokio::sync::Mutex<Option<WriteHalf<SerialStream>>>,
    /// Reader task while open
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Forward received bytes only while notifications are on
    notify: Arc<AtomicBool>,
    name: String,
}

impl SerialRadio {
    pub fn new(path: impl Into<String>, baud_rate: u32, events: mpsc::Sender<RadioEvent>) -> Self {
        let path = path.into();
        let name = format!("serial:{}", path);
        Self {
            path,
            baud_rate,
            events,
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            notify: Arc::new(AtomicBool::new(false)),
            name,
        }
    }

    fn characteristic() -> GattCharacteristic {
        GattCharacteristic {
            uuid: bluetooth_uuid(SPP_SERVICE),
            service: bluetooth_uuid(SPP_SERVICE),
            properties: CharacteristicProperties {
                notify: true,
                write_without_response: true,
                ..Default::default()
            },
        }
    }

    async fn read_loop(
        mut port: ReadHalf<SerialStream>,
        notify: Arc<AtomicBool>,
        events: mpsc::Sender<RadioEvent>,
    ) {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let reason = loop {
            match port.read(&mut buf).await {
                Ok(0) => break "port closed".to_string(),
                Ok(n) => {
                    if !notify.load(Ordering::Acquire) {
                        continue;
                    }
                    let event = RadioEvent::Notification(Bytes::copy_from_slice(&buf[..n]));
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => break e.to_string(),
            }
        };
        warn!("Serial link lost: {}", reason);
        let _ = events.send(RadioEvent::Disconnected { reason }).await;
    }

    fn close(&self) {
        self.notify.store(false, Ordering::Release);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl Radio for SerialRadio {
    fn name(&self) -> &str {
        &self.name
    }

    /// The port is "discovered" when its device node exists
    async fn start_scan(&self) -> Result<(), LinkError> {
        if Path::new(&self.path).exists() {
            let event = RadioEvent::DeviceDiscovered {
                address: DeviceAddress::new(self.path.clone()),
                name: None,
            };
            if self.events.send(event).await.is_err() {
                return Err(LinkError::Radio("event channel closed".into()));
            }
        } else {
            debug!("Serial port {} not present", self.path);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        Ok(())
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<(), LinkError> {
        if *address != DeviceAddress::new(self.path.clone()) {
            return Err(LinkError::UnknownDevice(address.to_string()));
        }
        self.close();

        let stream = tokio_serial::new(&self.path, self.baud_rate).open_native_async()?;
        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        let reader = tokio::spawn(Self::read_loop(
            read_half,
            self.notify.clone(),
            self.events.clone(),
        ));
        *self.reader.lock() = Some(reader);
        info!("Opened {} at {} baud", self.path, self.baud_rate);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.close();
        self.writer.lock().await.take();
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, LinkError> {
        if self.writer.lock().await.is_none() {
            return Err(LinkError::NotReady);
        }
        Ok(vec![GattService {
            uuid: bluetooth_uuid(SPP_SERVICE),
            characteristics: vec![Self::characteristic()],
        }])
    }

    async fn set_notify(
        &self,
        _characteristic: &GattCharacteristic,
        enabled: bool,
    ) -> Result<(), LinkError> {
        self.notify.store(enabled, Ordering::Release);
        Ok(())
    }

    async fn write(
        &self,
        _characteristic: &GattCharacteristic,
        data: &[u8],
        _mode: WriteMode,
    ) -> Result<(), LinkError> {
        let mut writer = self.writer.lock().await;
        let port = writer.as_mut().ok_or(LinkError::NotReady)?;
        port.write_all(data).await?;
        port.flush().await?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), LinkError> {
        self.disconnect().await
    }
}
