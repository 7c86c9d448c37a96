//! Live Telemetry Store
//!
//! Latest decoded RPM, throttle and speed, each stamped with the time its
//! frame was received. Readers always see whole snapshots.

use crate::pid::TelemetryValue;
use parking_lot::RwLock;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Point-in-time copy of the three telemetry fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    /// Engine speed in revolutions per minute
    pub rpm: u32,
    /// Throttle position, 0-100
    pub throttle_pct: u8,
    /// Vehicle speed in km/h
    pub speed_kmh: u8,
}

/// Identifies one telemetry field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TelemetryField {
    Rpm,
    Throttle,
    Speed,
}

#[derive(Debug, Clone, Copy, Default)]
struct Stamped<T> {
    value: T,
    at: Option<Instant>,
}

impl<T: Default + Copy> Stamped<T> {
    /// Returns false when `at` is older than the stored stamp
    fn set(&mut self, value: T, at: Instant) -> bool {
        if matches!(self.at, Some(prev) if at < prev) {
            return false;
        }
        self.value = value;
        self.at = Some(at);
        true
    }

    /// Stored value, or the default once it is older than `max_age`
    fn fresh(&self, now: Instant, max_age: Duration) -> T {
        match self.at {
            Some(at) if now.saturating_duration_since(at) <= max_age => self.value,
            _ => T::default(),
        }
    }

    fn expire(&mut self, now: Instant, max_age: Duration) -> bool {
        match self.at {
            Some(at) if now.saturating_duration_since(at) > max_age => {
                self.value = T::default();
                self.at = None;
                true
            }
            _ => false,
        }
    }

    fn clear(&mut self) {
        self.value = T::default();
        self.at = None;
    }
}

#[derive(Debug, Default)]
struct Fields {
    rpm: Stamped<u32>,
    throttle: Stamped<u8>,
    speed: Stamped<u8>,
}

/// Shared telemetry, written by the receive path and read by consumers
#[derive(Debug, Default)]
pub struct TelemetryStore {
    fields: RwLock<Fields>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one decoded value received at `at`.
    ///
    /// Returns false when a newer value is already stored.
    pub fn apply(&self, value: TelemetryValue, at: Instant) -> bool {
        let mut fields = self.fields.write();
        let applied = match value {
            TelemetryValue::Rpm(rpm) => fields.rpm.set(rpm, at),
            TelemetryValue::ThrottlePct(pct) => fields.throttle.set(pct, at),
            TelemetryValue::SpeedKmh(kmh) => fields.speed.set(kmh, at),
        };
        if !applied {
            debug!("Discarding out-of-order telemetry update {:?}", value);
        }
        applied
    }

    /// Consistent copy of all three fields
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let fields = self.fields.read();
        TelemetrySnapshot {
            rpm: fields.rpm.value,
            throttle_pct: fields.throttle.value,
            speed_kmh: fields.speed.value,
        }
    }

    /// Consistent copy in which fields older than `max_age` read as zero.
    ///
    /// Unlike [`TelemetryStore::expire_stale`] this leaves the store untouched.
    pub fn snapshot_fresh(&self, now: Instant, max_age: Duration) -> TelemetrySnapshot {
        let fields = self.fields.read();
        TelemetrySnapshot {
            rpm: fields.rpm.fresh(now, max_age),
            throttle_pct: fields.throttle.fresh(now, max_age),
            speed_kmh: fields.speed.fresh(now, max_age),
        }
    }

    /// Reset fields whose last update is older than `max_age`
    pub fn expire_stale(&self, now: Instant, max_age: Duration) -> Vec<TelemetryField> {
        let mut fields = self.fields.write();
        let mut expired = Vec::new();
        if fields.rpm.expire(now, max_age) {
            expired.push(TelemetryField::Rpm);
        }
        if fields.throttle.expire(now, max_age) {
            expired.push(TelemetryField::Throttle);
        }
        if fields.speed.expire(now, max_age) {
            expired.push(TelemetryField::Speed);
        }
        expired
    }

    /// Zero every field
    pub fn clear(&self) {
        let mut fields = self.fields.write();
        fields.rpm.clear();
        fields.throttle.clear();
        fields.speed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_apply_and_snapshot() {
        let store = TelemetryStore::new();
        let now = Instant::now();
        store.apply(TelemetryValue::Rpm(1726), now);
        store.apply(TelemetryValue::SpeedKmh(60), now);
        store.apply(TelemetryValue::ThrottlePct(35), now);
        assert_eq!(
            store.snapshot(),
            TelemetrySnapshot {
                rpm: 1726,
                throttle_pct: 35,
                speed_kmh: 60
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_update_is_discarded() {
        let store = TelemetryStore::new();
        let earlier = Instant::now();
        tokio::time::advance(Duration::from_millis(100)).await;
        let later = Instant::now();

        assert!(store.apply(TelemetryValue::Rpm(2000), later));
        assert!(!store.apply(TelemetryValue::Rpm(800), earlier));
        assert_eq!(store.snapshot().rpm, 2000);

        // same stamp applies
        assert!(store.apply(TelemetryValue::Rpm(2100), later));
        assert_eq!(store.snapshot().rpm, 2100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_stale_resets_only_old_fields() {
        let store = TelemetryStore::new();
        store.apply(TelemetryValue::Rpm(900), Instant::now());
        tokio::time::advance(Duration::from_millis(700)).await;
        store.apply(TelemetryValue::SpeedKmh(30), Instant::now());

        let expired = store.expire_stale(Instant::now(), Duration::from_millis(600));
        assert_eq!(expired, vec![TelemetryField::Rpm]);
        let snap = store.snapshot();
        assert_eq!(snap.rpm, 0);
        assert_eq!(snap.speed_kmh, 30);

        // an expired field is not expired again
        assert!(store
            .expire_stale(Instant::now(), Duration::from_millis(600))
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_snapshot_hides_old_fields_without_clearing() {
        let store = TelemetryStore::new();
        store.apply(TelemetryValue::Rpm(820), Instant::now());
        tokio::time::advance(Duration::from_millis(400)).await;
        store.apply(TelemetryValue::SpeedKmh(45), Instant::now());
        tokio::time::advance(Duration::from_millis(300)).await;

        let max_age = Duration::from_millis(600);
        assert_eq!(
            store.snapshot_fresh(Instant::now(), max_age),
            TelemetrySnapshot {
                rpm: 0,
                throttle_pct: 0,
                speed_kmh: 45
            }
        );
        // the stored value survives for a longer window
        let wide = store.snapshot_fresh(Instant::now(), Duration::from_millis(1000));
        assert_eq!(wide.rpm, 820);
        assert_eq!(store.snapshot().rpm, 820);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear() {
        let store = TelemetryStore::new();
        store.apply(TelemetryValue::ThrottlePct(50), Instant::now());
        store.clear();
        assert_eq!(store.snapshot(), TelemetrySnapshot::default());
    }
}
