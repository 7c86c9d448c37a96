//! Seams between the command session and the radio link

use crate::error::ObdError;
use async_trait::async_trait;

/// Outbound half of the link: delivers command bytes to the adapter
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write `bytes` to the adapter's receive characteristic
    async fn write(&self, bytes: &[u8]) -> Result<(), ObdError>;
}

/// Inbound half of the link: receives lifecycle and data callbacks
pub trait LinkListener: Send + Sync {
    /// A new connection finished subscribing and is ready for commands
    fn on_link_up(&self, generation: u64);

    /// Notification payload from the adapter, in arrival order
    fn on_bytes(&self, bytes: &[u8]);

    /// The connection was lost or abandoned
    fn on_link_down(&self);
}
