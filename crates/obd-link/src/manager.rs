//! Connection Lifecycle Manager
//!
//! Owns discovery, connection, UART resolution and notification
//! subscription against one configured adapter, and the reconnection
//! policy around them. Radio activity arrives as [`RadioEvent`]s; the
//! resulting link state is published on a `watch` channel and the command
//! session is told about link up/down through [`LinkListener`].

use crate::backoff::Backoff;
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::gatt::{resolve_uart, UartHandles};
use crate::radio::{DeviceAddress, GattCharacteristic, Radio, RadioEvent};
use crate::writer::UartSlot;
use obd_protocol::{ConnectionState, LinkListener, LinkSnapshot};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Drives the adapter connection through its lifecycle
pub struct LinkManager {
    /// Radio stack
    radio: Arc<dyn Radio>,
    /// Inbound radio activity
    events: mpsc::Receiver<RadioEvent>,
    /// Command session callbacks
    listener: Arc<dyn LinkListener>,
    /// Resolved UART characteristics shared with the writer
    slot: UartSlot,
    /// Lifecycle configuration
    config: LinkConfig,
    /// Configured adapter identity
    target: DeviceAddress,
    /// Published state
    state_tx: watch::Sender<LinkSnapshot>,
    /// Incremented on every successful connection
    generation: u64,
    /// Listener has been told the link is up
    attached: bool,
    /// Reconnection delays
    backoff: Backoff,
    /// Next scheduled discovery restart
    reconnect_at: Option<Instant>,
    /// End of the current scan window
    scan_deadline: Option<Instant>,
    /// When the manager last went Idle or Disconnected
    idle_since: Option<Instant>,
}

impl LinkManager {
    pub fn new(
        radio: Arc<dyn Radio>,
        events: mpsc::Receiver<RadioEvent>,
        listener: Arc<dyn LinkListener>,
        slot: UartSlot,
        config: LinkConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(LinkSnapshot::default());
        let backoff = Backoff::new(config.backoff_initial(), config.backoff_max());
        let target = config.target();
        Self {
            radio,
            events,
            listener,
            slot,
            config,
            target,
            state_tx,
            generation: 0,
            attached: false,
            backoff,
            reconnect_at: None,
            scan_deadline: None,
            idle_since: Some(Instant::now()),
        }
    }

    /// Watch the published link state
    pub fn subscribe(&self) -> watch::Receiver<LinkSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Next scheduled discovery restart, if any
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    fn set_state(&mut self, state: ConnectionState) {
        let previous = self.state();
        if previous != state {
            debug!("Link state {} -> {}", previous, state);
        }
        self.idle_since = match state {
            ConnectionState::Idle | ConnectionState::Disconnected => {
                self.idle_since.or(Some(Instant::now()))
            }
            _ => None,
        };
        let snapshot = LinkSnapshot {
            state,
            generation: self.generation,
        };
        self.state_tx.send_replace(snapshot);
    }

    /// Begin scanning for the target unless a connection is already in progress
    pub async fn start_discovery(&mut self) {
        match self.state() {
            ConnectionState::Idle | ConnectionState::Disconnected => {}
            other => {
                debug!("Discovery not started, link is {}", other);
                return;
            }
        }
        self.reconnect_at = None;

        info!("Scanning for OBD adapter {} via {}", self.target, self.radio.name());
        self.set_state(ConnectionState::Scanning);
        match self.radio.start_scan().await {
            Ok(()) => {
                self.scan_deadline = Some(Instant::now() + self.config.scan_duration());
            }
            Err(e) => {
                warn!("Failed to start scan: {}", e);
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    /// React to one radio event
    pub async fn on_transport_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::DeviceDiscovered { address, name } => {
                if self.state() != ConnectionState::Scanning || address != self.target {
                    return;
                }
                info!(
                    "Found OBD adapter {} ({})",
                    address,
                    name.as_deref().unwrap_or("unnamed")
                );
                // connecting while the scan is active races on the same radio
                if let Err(e) = self.radio.stop_scan().await {
                    warn!("Failed to stop scan before connecting: {}", e);
                }
                self.scan_deadline = None;
                self.establish().await;
            }
            RadioEvent::ScanStopped => {
                if self.state() == ConnectionState::Scanning {
                    info!("Scan ended without finding {}", self.target);
                    self.scan_finished();
                }
            }
            RadioEvent::Disconnected { reason } => match self.state() {
                ConnectionState::Idle | ConnectionState::Scanning | ConnectionState::Disconnected => {
                    debug!("Ignoring disconnect while {}: {}", self.state(), reason);
                }
                _ => {
                    warn!("OBD adapter disconnected: {}", reason);
                    self.drop_link();
                    self.schedule_reconnect();
                }
            },
            RadioEvent::Notification(bytes) => {
                if self.state() == ConnectionState::Ready {
                    self.listener.on_bytes(&bytes);
                } else {
                    debug!("Dropping {} bytes received while {}", bytes.len(), self.state());
                }
            }
        }
    }

    async fn establish(&mut self) {
        self.set_state(ConnectionState::Connecting);
        let ceiling = self.config.connect_ceiling();

        match timeout(ceiling, self.radio.connect(&self.target)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.fail(e),
            Err(_) => {
                error!(
                    "Connect to {} stuck for {}ms, resetting radio",
                    self.target, self.config.connect_ceiling_ms
                );
                if let Err(e) = self.radio.reset().await {
                    warn!("Radio reset failed: {}", e);
                }
                return self.fail(LinkError::ConnectTimeout(self.config.connect_ceiling_ms));
            }
        }
        info!("Connected to {}", self.target);

        match timeout(ceiling, self.prepare()).await {
            Ok(Ok(handles)) => self.on_established(handles),
            Ok(Err(e)) => {
                self.disconnect_quietly().await;
                self.fail(e);
            }
            Err(_) => {
                self.disconnect_quietly().await;
                self.fail(LinkError::ConnectTimeout(self.config.connect_ceiling_ms));
            }
        }
    }

    async fn prepare(&mut self) -> Result<UartHandles, LinkError> {
        self.set_state(ConnectionState::DiscoveringServices);
        let services = self.radio.discover_services().await?;
        debug!("Discovered {} services", services.len());
        let handles = resolve_uart(&services, &self.config.uart_candidates)?;

        self.set_state(ConnectionState::SubscribingNotifications);
        self.subscribe_notifications(&handles.rx).await?;
        Ok(handles)
    }

    /// Each descriptor write is acknowledged before the next one is issued
    async fn subscribe_notifications(
        &self,
        characteristic: &GattCharacteristic,
    ) -> Result<(), LinkError> {
        let sequence: &[bool] = if self.config.notify_quirk {
            &[true, false, true]
        } else {
            &[true]
        };
        for &enabled in sequence {
            self.radio.set_notify(characteristic, enabled).await?;
            debug!("Notifications {} on {}", if enabled { "enabled" } else { "disabled" }, characteristic.uuid);
            sleep(self.config.notify_settle()).await;
        }
        Ok(())
    }

    fn on_established(&mut self, handles: UartHandles) {
        *self.slot.lock() = Some(handles);
        self.generation += 1;
        self.backoff.reset();
        self.reconnect_at = None;
        self.listener.on_link_up(self.generation);
        self.attached = true;
        self.set_state(ConnectionState::Ready);
        info!("OBD adapter link ready (generation {})", self.generation);
    }

    fn fail(&mut self, err: LinkError) {
        warn!("Connection attempt to {} failed: {}", self.target, err);
        self.drop_link();
        self.schedule_reconnect();
    }

    async fn disconnect_quietly(&self) {
        if let Err(e) = self.radio.disconnect().await {
            debug!("Disconnect after failed setup: {}", e);
        }
    }

    /// Forget handles, detach the session and publish Disconnected
    fn drop_link(&mut self) {
        *self.slot.lock() = None;
        if std::mem::take(&mut self.attached) {
            self.listener.on_link_down();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        info!("Reconnecting in {}ms", delay.as_millis());
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn scan_finished(&mut self) {
        self.scan_deadline = None;
        self.set_state(ConnectionState::Idle);
        self.reconnect_at = Some(Instant::now() + self.config.scan_restart_delay());
    }

    async fn on_scan_deadline(&mut self) {
        self.scan_deadline = None;
        if self.state() != ConnectionState::Scanning {
            return;
        }
        if let Err(e) = self.radio.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        info!(
            "No adapter found within {}ms, retrying in {}ms",
            self.config.scan_duration_ms, self.config.scan_restart_delay_ms
        );
        self.scan_finished();
    }

    /// Restart discovery when idle too long with nothing scheduled
    pub async fn check_watchdog(&mut self, now: Instant) {
        if self.reconnect_at.is_some() {
            return;
        }
        let Some(since) = self.idle_since else {
            return;
        };
        if now.saturating_duration_since(since) >= self.config.idle_timeout() {
            warn!(
                "Link idle for {}ms with no attempt scheduled, restarting discovery",
                now.saturating_duration_since(since).as_millis()
            );
            self.start_discovery().await;
        }
    }

    /// Run until `shutdown` flips to true or the radio event stream ends
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.start_discovery().await;

        let mut watchdog = interval(self.config.watchdog_interval());
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        watchdog.tick().await;

        loop {
            let reconnect_at = self.reconnect_at;
            let scan_deadline = self.scan_deadline;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        error!("Radio event stream closed");
                        break;
                    }
                },
                _ = watchdog.tick() => self.check_watchdog(Instant::now()).await,
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.start_discovery().await;
                }
                _ = sleep_until(scan_deadline.unwrap_or_else(Instant::now)), if scan_deadline.is_some() => {
                    self.on_scan_deadline().await;
                }
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        info!("Link manager shutting down");
        if self.state() == ConnectionState::Scanning {
            if let Err(e) = self.radio.stop_scan().await {
                debug!("Stop scan on shutdown: {}", e);
            }
        }
        if self.slot.lock().is_some() {
            self.disconnect_quietly().await;
        }
        self.drop_link();
        self.reconnect_at = None;
        self.scan_deadline = None;
        self.set_state(ConnectionState::Idle);
    }
}
