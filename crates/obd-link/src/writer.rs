//! Outbound byte path from the command session to the radio

use crate::gatt::UartHandles;
use crate::radio::Radio;
use async_trait::async_trait;
use obd_protocol::{ObdError, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Resolved UART characteristics, present only while the link is up
pub type UartSlot = Arc<Mutex<Option<UartHandles>>>;

/// Writes session commands to the UART TX characteristic in bounded chunks
pub struct LinkWriter {
    radio: Arc<dyn Radio>,
    slot: UartSlot,
    max_chunk: usize,
}

impl LinkWriter {
    pub fn new(radio: Arc<dyn Radio>, slot: UartSlot, max_chunk: usize) -> Self {
        Self {
            radio,
            slot,
            max_chunk: max_chunk.max(1),
        }
    }
}

#[async_trait]
impl Transport for LinkWriter {
    async fn write(&self, bytes: &[u8]) -> Result<(), ObdError> {
        let handles = self.slot.lock().clone().ok_or(ObdError::NotConnected)?;
        for chunk in bytes.chunks(self.max_chunk) {
            trace!("Writing {} bytes to {}", chunk.len(), handles.tx.uuid);
            self.radio
                .write(&handles.tx, chunk, handles.write_mode)
                .await
                .map_err(ObdError::from)?;
        }
        Ok(())
    }
}
