//! Link and ECU Status Flags

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

/// Radio connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    SubscribingNotifications,
    Ready,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::DiscoveringServices => "discovering services",
            ConnectionState::SubscribingNotifications => "subscribing",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(text)
    }
}

/// Published link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LinkSnapshot {
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Incremented on every successful connection
    pub generation: u64,
}

impl LinkSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }
}

/// Whether the vehicle ECU has answered since the link came up
#[derive(Debug, Default)]
pub struct EcuStatus {
    connected: AtomicBool,
    losses: AtomicU64,
}

impl EcuStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Set after a successful `0100` probe
    pub fn mark_verified(&self) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!("ECU connectivity verified");
        }
    }

    /// Polling gave up on the ECU. Returns true if it was connected.
    pub fn declare_lost(&self) -> bool {
        let was = self.connected.swap(false, Ordering::AcqRel);
        if was {
            let total = self.losses.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("ECU declared disconnected (loss #{})", total);
        }
        was
    }

    /// The radio link went down, so the ECU is unreachable too
    pub fn link_lost(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Number of times polling has declared the ECU lost
    pub fn loss_count(&self) -> u64 {
        self.losses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecu_status_transitions() {
        let ecu = EcuStatus::new();
        assert!(!ecu.is_connected());
        ecu.mark_verified();
        assert!(ecu.is_connected());
        assert!(ecu.declare_lost());
        assert!(!ecu.declare_lost());
        assert_eq!(ecu.loss_count(), 1);

        ecu.mark_verified();
        ecu.link_lost();
        assert!(!ecu.is_connected());
        assert_eq!(ecu.loss_count(), 1);
    }

    #[test]
    fn test_snapshot_ready() {
        let snap = LinkSnapshot {
            state: ConnectionState::Ready,
            generation: 1,
        };
        assert!(snap.is_ready());
        assert!(!LinkSnapshot::default().is_ready());
    }
}
