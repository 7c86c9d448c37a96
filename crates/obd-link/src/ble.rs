//! BLE radio back-end built on `btleplug`
//!
//! # Requirements
//!
//! Enable the `ble` feature. On Linux the BlueZ D-Bus API is used:
//! ```bash
//! apt install libdbus-1-dev
//! ```

use crate::error::LinkError;
use crate::radio::{
    CharacteristicProperties, DeviceAddress, GattCharacteristic, GattService, Radio, RadioEvent,
    WriteMode,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct BleShared {
    /// Address to peripheral id for every device seen while scanning
    seen: HashMap<DeviceAddress, PeripheralId>,
    /// Connected peripheral
    active: Option<Peripheral>,
    /// Characteristics of the connected peripheral, by (service, uuid)
    characteristics: HashMap<(Uuid, Uuid), Characteristic>,
    /// Notification forwarding task
    notification_pump: Option<JoinHandle<()>>,
}

/// BLE central on the first local adapter
pub struct BleRadio {
    adapter: Adapter,
    events: mpsc::Sender<RadioEvent>,
    shared: Arc<Mutex<BleShared>>,
    name: String,
    central_pump: JoinHandle<()>,
}

impl BleRadio {
    /// Open the first Bluetooth adapter and start forwarding its events
    pub async fn new(events: mpsc::Sender<RadioEvent>) -> Result<Self, LinkError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Radio("no Bluetooth adapters found".into()))?;
        let name = adapter
            .adapter_info()
            .await
            .unwrap_or_else(|_| "ble".to_string());
        info!("Using Bluetooth adapter {}", name);

        let shared = Arc::new(Mutex::new(BleShared::default()));
        let central_events = adapter.events().await?;
        let central_pump = tokio::spawn(Self::pump_central_events(
            adapter.clone(),
            central_events,
            shared.clone(),
            events.clone(),
        ));

        Ok(Self {
            adapter,
            events,
            shared,
            name,
            central_pump,
        })
    }

    async fn pump_central_events(
        adapter: Adapter,
        mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
        shared: Arc<Mutex<BleShared>>,
        events: mpsc::Sender<RadioEvent>,
    ) {
        while let Some(event) = central_events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    let Ok(peripheral) = adapter.peripheral(&id).await else {
                        continue;
                    };
                    let Ok(Some(properties)) = peripheral.properties().await else {
                        continue;
                    };
                    let address = DeviceAddress::new(properties.address.to_string());
                    let first_sighting = shared.lock().seen.insert(address.clone(), id).is_none();
                    if first_sighting {
                        debug!("Discovered {} {:?}", address, properties.local_name);
                    }
                    let event = RadioEvent::DeviceDiscovered {
                        address,
                        name: properties.local_name,
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let was_active = {
                        let shared = shared.lock();
                        shared.active.as_ref().map(|p| p.id()) == Some(id)
                    };
                    if was_active {
                        let event = RadioEvent::Disconnected {
                            reason: "peripheral disconnected".to_string(),
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
        debug!("Central event stream ended");
    }

    fn active(&self) -> Result<Peripheral, LinkError> {
        self.shared.lock().active.clone().ok_or(LinkError::NotReady)
    }

    fn characteristic(&self, ch: &GattCharacteristic) -> Result<Characteristic, LinkError> {
        self.shared
            .lock()
            .characteristics
            .get(&(ch.service, ch.uuid))
            .cloned()
            .ok_or(LinkError::CharacteristicMissing {
                service: ch.service,
                role: "resolved",
            })
    }

    fn clear_connection(&self) -> Option<Peripheral> {
        let mut shared = self.shared.lock();
        if let Some(pump) = shared.notification_pump.take() {
            pump.abort();
        }
        shared.characteristics.clear();
        shared.active.take()
    }
}

fn properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
    }
}

#[async_trait]
impl Radio for BleRadio {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start_scan(&self) -> Result<(), LinkError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<(), LinkError> {
        let id = self
            .shared
            .lock()
            .seen
            .get(address)
            .cloned()
            .ok_or_else(|| LinkError::UnknownDevice(address.to_string()))?;
        let peripheral = self.adapter.peripheral(&id).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        let mut notifications = peripheral.notifications().await?;
        let events = self.events.clone();
        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let event = RadioEvent::Notification(Bytes::from(notification.value));
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });

        let mut shared = self.shared.lock();
        if let Some(previous) = shared.notification_pump.replace(pump) {
            previous.abort();
        }
        shared.active = Some(peripheral);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        if let Some(peripheral) = self.clear_connection() {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, LinkError> {
        let peripheral = self.active()?;
        peripheral.discover_services().await?;

        let mut services = Vec::new();
        let mut characteristics = HashMap::new();
        for service in peripheral.services() {
            let mut gatt = GattService {
                uuid: service.uuid,
                characteristics: Vec::new(),
            };
            for ch in service.characteristics {
                gatt.characteristics.push(GattCharacteristic {
                    uuid: ch.uuid,
                    service: service.uuid,
                    properties: properties(ch.properties),
                });
                characteristics.insert((service.uuid, ch.uuid), ch);
            }
            services.push(gatt);
        }
        self.shared.lock().characteristics = characteristics;
        Ok(services)
    }

    async fn set_notify(
        &self,
        characteristic: &GattCharacteristic,
        enabled: bool,
    ) -> Result<(), LinkError> {
        let peripheral = self.active()?;
        let ch = self.characteristic(characteristic)?;
        if enabled {
            peripheral.subscribe(&ch).await?;
        } else {
            peripheral.unsubscribe(&ch).await?;
        }
        Ok(())
    }

    async fn write(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), LinkError> {
        let peripheral = self.active()?;
        let ch = self.characteristic(characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral.write(&ch, data, write_type).await?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), LinkError> {
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Stop scan during reset: {}", e);
        }
        if let Some(peripheral) = self.clear_connection() {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect during reset: {}", e);
            }
        }
        self.shared.lock().seen.clear();
        Ok(())
    }
}

impl Drop for BleRadio {
    fn drop(&mut self) {
        self.central_pump.abort();
        if let Some(pump) = self.shared.lock().notification_pump.take() {
            pump.abort();
        }
    }
}
