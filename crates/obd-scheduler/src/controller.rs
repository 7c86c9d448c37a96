//! Polling controller
//!
//! Drives the adapter through `WaitForRadio -> WaitForEcu -> Polling`:
//! initializes the session on every fresh link, verifies the ECU, then
//! polls telemetry with the adaptive policy until the ECU or the link is
//! lost.

use crate::policy::{FailureVerdict, PollingConfig, PollingMode, PollingPolicy};
use obd_protocol::{
    AdapterFault, CommandSession, EcuVerifier, LinkSnapshot, ObdError, Pacing, Reply,
    SessionState, VerifierConfig,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Driver loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PollerState {
    /// No usable link, or the session needs initialization
    #[default]
    WaitForRadio,
    /// Session initialized, ECU not yet answering
    WaitForEcu,
    Polling,
}

/// Result of one polling cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    /// The failure budget at the delay ceiling ran out
    EcuLost,
    /// The link dropped mid-cycle
    LinkLost,
}

/// Published controller status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PollerStatus {
    pub state: PollerState,
    pub mode: PollingMode,
    pub delay_ms: u64,
    /// Maximum telemetry age for the active mode (milliseconds)
    pub freshness_ms: u64,
    /// Consecutive `UNABLE TO CONNECT` replies
    pub unable_to_connect: u32,
    /// Completed polling cycles since start
    pub cycles: u64,
}

impl PollerStatus {
    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }
}

/// How one request ended
#[derive(Debug)]
enum RequestOutcome {
    /// Number of frames that carried PIDs
    Data(usize),
    /// Adapter still searching for a protocol; not a failure
    Searching,
    Failed(ObdError),
    LinkLost,
}

/// Adaptive polling loop over a [`CommandSession`]
pub struct PollingController {
    session: Arc<CommandSession>,
    verifier: EcuVerifier,
    policy: PollingPolicy,
    link: watch::Receiver<LinkSnapshot>,
    state: PollerState,
    cycles: u64,
    /// Consecutive `SEARCHING...` replies
    searching_streak: u32,
    status_tx: watch::Sender<PollerStatus>,
}

impl PollingController {
    pub fn new(
        session: Arc<CommandSession>,
        link: watch::Receiver<LinkSnapshot>,
        verifier_config: VerifierConfig,
        config: PollingConfig,
    ) -> Self {
        let verifier = EcuVerifier::new(session.clone(), verifier_config);
        let policy = PollingPolicy::new(config);
        let (status_tx, _) = watch::channel(PollerStatus {
            delay_ms: policy.delay_ms(),
            freshness_ms: policy.freshness().as_millis() as u64,
            ..Default::default()
        });
        Self {
            session,
            verifier,
            policy,
            link,
            state: PollerState::WaitForRadio,
            cycles: 0,
            searching_streak: 0,
            status_tx,
        }
    }

    /// Watch the published controller status
    pub fn subscribe(&self) -> watch::Receiver<PollerStatus> {
        self.status_tx.subscribe()
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn policy(&self) -> &PollingPolicy {
        &self.policy
    }

    fn publish(&self) {
        self.status_tx.send_replace(PollerStatus {
            state: self.state,
            mode: self.policy.mode(),
            delay_ms: self.policy.delay_ms(),
            freshness_ms: self.policy.freshness().as_millis() as u64,
            unable_to_connect: self.policy.unable_to_connect_count(),
            cycles: self.cycles,
        });
    }

    fn set_state(&mut self, state: PollerState) {
        if self.state != state {
            debug!("Poller state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    /// Run until `shutdown` turns true or the link manager goes away
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting polling controller");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                keep_going = self.step() => {
                    if !keep_going {
                        warn!("Link manager stopped, polling ends");
                        break;
                    }
                }
            }
        }
        info!("Polling controller stopped");
    }

    /// Advance the state machine once; false once the link manager is gone
    pub async fn step(&mut self) -> bool {
        if self.state != PollerState::WaitForRadio && self.session_lost() {
            info!("Session lost its link, waiting for radio");
            self.set_state(PollerState::WaitForRadio);
        }

        match self.state {
            PollerState::WaitForRadio => self.wait_for_radio().await,
            PollerState::WaitForEcu => {
                self.wait_for_ecu().await;
                true
            }
            PollerState::Polling => {
                match self.tick().await {
                    CycleOutcome::Completed => {}
                    CycleOutcome::EcuLost => {
                        self.session.ecu().declare_lost();
                        self.set_state(PollerState::WaitForEcu);
                    }
                    CycleOutcome::LinkLost => self.set_state(PollerState::WaitForRadio),
                }
                true
            }
        }
    }

    fn session_lost(&self) -> bool {
        !self.session.is_link_up() || self.session.state() == SessionState::Uninitialized
    }

    async fn wait_for_radio(&mut self) -> bool {
        let ready = self.link.wait_for(|s| s.is_ready()).await.is_ok();
        if !ready {
            return false;
        }
        match self.session.initialize().await {
            Ok(()) => self.set_state(PollerState::WaitForEcu),
            Err(e) => {
                warn!(
                    "Session initialization failed: {}, retrying in {}ms",
                    e,
                    self.policy.config().init_retry_delay_ms
                );
                sleep(self.policy.config().init_retry_delay()).await;
            }
        }
        true
    }

    async fn wait_for_ecu(&mut self) {
        if self.verifier.verify().await {
            self.searching_streak = 0;
            self.policy.reset(Instant::now());
            self.set_state(PollerState::Polling);
            return;
        }
        if self.session_lost() {
            return;
        }

        let delay = self.policy.config().reverify_delay();
        info!("ECU not answering, re-verifying in {}ms", delay.as_millis());
        let link = &mut self.link;
        tokio::select! {
            _ = sleep(delay) => {}
            _ = async move {
                let _ = link.wait_for(|s| !s.is_ready()).await;
            } => {}
        }
    }

    /// One polling cycle: every command of the active mode, each followed by
    /// the adaptive delay
    pub async fn tick(&mut self) -> CycleOutcome {
        let now = Instant::now();
        self.policy.update_mode(now);
        let expired = self
            .session
            .telemetry()
            .expire_stale(now, self.policy.freshness());
        if !expired.is_empty() {
            debug!("Telemetry went stale: {:?}", expired);
        }

        let commands = self.policy.next_commands().to_vec();
        for command in &commands {
            match self.request(command).await {
                RequestOutcome::Data(frames) => {
                    // every frame counts, duplicates included
                    for _ in 0..frames {
                        self.policy.record_success(Instant::now());
                    }
                }
                RequestOutcome::Searching => {}
                RequestOutcome::Failed(reason) => {
                    debug!(
                        "{} failed: {} (delay {}ms)",
                        command,
                        reason,
                        self.policy.delay_ms()
                    );
                    if matches!(reason, ObdError::Adapter(AdapterFault::UnableToConnect)) {
                        self.policy.record_unable_to_connect();
                    }
                    if self.policy.record_failure() == FailureVerdict::EcuLost {
                        warn!(
                            "{} failures at {}ms delay, ECU considered disconnected",
                            self.policy.config().max_errors_at_max_delay,
                            self.policy.delay_ms()
                        );
                        self.publish();
                        return CycleOutcome::EcuLost;
                    }
                }
                RequestOutcome::LinkLost => return CycleOutcome::LinkLost,
            }
            self.publish();
            sleep(self.policy.delay()).await;
        }

        self.policy.finish_cycle(Instant::now());
        self.cycles += 1;
        self.publish();
        CycleOutcome::Completed
    }

    /// Send one command, reissuing it once if the adapter keeps searching
    async fn request(&mut self, command: &str) -> RequestOutcome {
        let limit = self.policy.config().response_timeout();
        let threshold = self.policy.config().searching_retry_threshold;
        let mut reissued = false;
        loop {
            let result = self.session.transact(command, Pacing::AwaitPrompt, limit).await;
            let outcome = classify(result);
            if !matches!(outcome, RequestOutcome::Searching) {
                self.searching_streak = 0;
                return outcome;
            }

            self.searching_streak += 1;
            if self.searching_streak <= threshold {
                return RequestOutcome::Searching;
            }
            if reissued {
                self.searching_streak = 0;
                return RequestOutcome::Failed(ObdError::Timeout(limit.as_millis() as u64));
            }
            info!(
                "Adapter searching for {} replies, reissuing {}",
                self.searching_streak, command
            );
            reissued = true;
        }
    }
}

fn classify(result: Result<Reply, ObdError>) -> RequestOutcome {
    match result {
        Ok(reply) if reply.has_data() => {
            RequestOutcome::Data(reply.frames.iter().filter(|f| !f.readings.is_empty()).count())
        }
        Ok(reply) => match (reply.fault(), reply.overflowed) {
            (Some(fault), _) => RequestOutcome::Failed(ObdError::Adapter(fault)),
            (None, _) if reply.is_searching() => RequestOutcome::Searching,
            (None, Some(len)) => RequestOutcome::Failed(ObdError::BufferOverflow(len)),
            (None, None) => RequestOutcome::Failed(ObdError::MalformedFrame(
                "no Mode 01 data in reply".into(),
            )),
        },
        Err(e) if e.is_link_loss() => RequestOutcome::LinkLost,
        Err(e) => RequestOutcome::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use obd_link::{EngineState, LinkConfig, LinkManager, LinkWriter, SimulatedAdapter, UartSlot};
    use obd_protocol::{EcuStatus, LinkListener, SessionConfig, TelemetryStore, Transport};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Weak;
    use tokio::task::JoinHandle;

    const ADDRESS: &str = SimulatedAdapter::DEFAULT_ADDRESS;

    /// Answers each write with the next canned reply, fed straight back
    /// into the session
    #[derive(Default)]
    struct ScriptedAdapter {
        session: Mutex<Weak<CommandSession>>,
        replies: Mutex<VecDeque<&'static [u8]>>,
    }

    impl ScriptedAdapter {
        fn queue(&self, reply: &'static [u8]) {
            self.replies.lock().push_back(reply);
        }
    }

    #[async_trait]
    impl Transport for ScriptedAdapter {
        async fn write(&self, _bytes: &[u8]) -> Result<(), ObdError> {
            let reply = self.replies.lock().pop_front();
            let session = self.session.lock().upgrade();
            if let (Some(reply), Some(session)) = (reply, session) {
                session.on_bytes(reply);
            }
            Ok(())
        }
    }

    fn scripted(polling: PollingConfig) -> (
        Arc<ScriptedAdapter>,
        Arc<CommandSession>,
        PollingController,
        watch::Sender<LinkSnapshot>,
    ) {
        let adapter = Arc::new(ScriptedAdapter::default());
        let session = Arc::new(CommandSession::new(
            adapter.clone(),
            Arc::new(TelemetryStore::new()),
            Arc::new(EcuStatus::new()),
            SessionConfig::default(),
        ));
        *adapter.session.lock() = Arc::downgrade(&session);
        session.on_link_up(1);
        session.on_bytes(b">");
        let (link_tx, link_rx) = watch::channel(LinkSnapshot::default());
        let controller =
            PollingController::new(session.clone(), link_rx, VerifierConfig::default(), polling);
        (adapter, session, controller, link_tx)
    }

    struct Rig {
        adapter: Arc<SimulatedAdapter>,
        session: Arc<CommandSession>,
        controller: PollingController,
        shutdown: watch::Sender<bool>,
        link_task: JoinHandle<()>,
    }

    fn rig(polling: PollingConfig) -> Rig {
        let (adapter, events) = SimulatedAdapter::new(ADDRESS, 256);
        let config = LinkConfig {
            device_address: ADDRESS.to_string(),
            ..Default::default()
        };
        let slot: UartSlot = Default::default();
        let writer = Arc::new(LinkWriter::new(
            adapter.clone(),
            slot.clone(),
            config.max_write_chunk,
        ));
        let session = Arc::new(CommandSession::new(
            writer,
            Arc::new(TelemetryStore::new()),
            Arc::new(EcuStatus::new()),
            SessionConfig::default(),
        ));
        let manager = LinkManager::new(adapter.clone(), events, session.clone(), slot, config);
        let link = manager.subscribe();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let link_task = tokio::spawn(manager.run(shutdown_rx));
        let controller = PollingController::new(
            session.clone(),
            link,
            VerifierConfig::default(),
            polling,
        );
        Rig {
            adapter,
            session,
            controller,
            shutdown,
            link_task,
        }
    }

    async fn reach(controller: &mut PollingController, state: PollerState) {
        for _ in 0..20 {
            if controller.state() == state {
                return;
            }
            assert!(controller.step().await);
        }
        panic!("never reached {:?}", state);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initializes_verifies_and_polls() {
        let mut rig = rig(PollingConfig::default());
        rig.adapter.set_engine(EngineState {
            rpm: 1726,
            throttle_raw: 0x5A,
            speed_kmh: 60,
        });

        reach(&mut rig.controller, PollerState::Polling).await;
        assert!(rig.session.ecu().is_connected());
        assert_eq!(rig.session.state(), SessionState::ReadyForCommand);

        assert_eq!(rig.controller.tick().await, CycleOutcome::Completed);
        let telemetry = rig.session.telemetry().snapshot();
        assert_eq!(telemetry.rpm, 1726);
        assert_eq!(telemetry.throttle_pct, 35);
        assert_eq!(telemetry.speed_kmh, 60);
        assert_eq!(rig.controller.policy().delay_ms(), 175);
        assert_eq!(rig.adapter.commands().last().map(String::as_str), Some("010C110D"));

        rig.shutdown.send(true).unwrap();
        rig.link_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_adapter_exhausts_failure_budget() {
        let mut rig = rig(PollingConfig::default());
        reach(&mut rig.controller, PollerState::Polling).await;

        rig.adapter.set_responsive(false);
        let mut ticks = 0;
        loop {
            ticks += 1;
            assert!(ticks <= 20, "failure budget never ran out");
            if rig.controller.tick().await == CycleOutcome::EcuLost {
                break;
            }
        }
        assert_eq!(rig.controller.policy().delay_ms(), 500);
        assert_eq!(rig.controller.policy().errors_at_max_delay(), 0);

        rig.shutdown.send(true).unwrap();
        rig.link_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ecu_loss_returns_to_verification() {
        let mut rig = rig(PollingConfig::default());
        reach(&mut rig.controller, PollerState::Polling).await;

        rig.adapter.set_ecu_online(false);
        for _ in 0..40 {
            rig.controller.step().await;
            if rig.controller.state() == PollerState::WaitForEcu {
                break;
            }
        }
        assert_eq!(rig.controller.state(), PollerState::WaitForEcu);
        assert!(!rig.session.ecu().is_connected());
        assert_eq!(rig.session.ecu().loss_count(), 1);

        rig.adapter.set_ecu_online(true);
        reach(&mut rig.controller, PollerState::Polling).await;
        assert!(rig.session.ecu().is_connected());

        rig.shutdown.send(true).unwrap();
        rig.link_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unable_to_connect_tracked_apart_from_ecu_loss() {
        let mut rig = rig(PollingConfig::default());
        reach(&mut rig.controller, PollerState::Polling).await;
        let status = rig.controller.subscribe();

        rig.adapter.set_ecu_online(false);
        assert_eq!(rig.controller.tick().await, CycleOutcome::Completed);
        assert_eq!(rig.controller.tick().await, CycleOutcome::Completed);
        assert_eq!(rig.controller.policy().unable_to_connect_count(), 2);
        assert_eq!(status.borrow().unable_to_connect, 2);
        assert_eq!(rig.controller.policy().delay_ms(), 275);
        // loss is still decided by the delay ceiling alone
        assert!(rig.session.ecu().is_connected());

        rig.adapter.set_ecu_online(true);
        assert_eq!(rig.controller.tick().await, CycleOutcome::Completed);
        assert_eq!(rig.controller.policy().unable_to_connect_count(), 0);
        assert_eq!(status.borrow().unable_to_connect, 0);

        rig.shutdown.send(true).unwrap();
        rig.link_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_frame_counts_once_per_frame() {
        let (adapter, session, mut controller, _link) = scripted(PollingConfig::default());

        adapter.queue(b"NO DATA\r\r>");
        assert_eq!(controller.tick().await, CycleOutcome::Completed);
        assert_eq!(controller.policy().delay_ms(), 225);

        adapter.queue(b"41 0D 3C\r\r>");
        assert_eq!(controller.tick().await, CycleOutcome::Completed);
        assert_eq!(controller.policy().delay_ms(), 220);
        let once = session.telemetry().snapshot();
        assert_eq!(once.speed_kmh, 60);

        // the same frame twice in one reply
        adapter.queue(b"41 0D 3C\r41 0D 3C\r\r>");
        assert_eq!(controller.tick().await, CycleOutcome::Completed);
        assert_eq!(session.telemetry().snapshot(), once);
        assert_eq!(controller.policy().delay_ms(), 210);
        assert_eq!(controller.policy().errors_at_max_delay(), 0);
    }

    /// 276 bytes without a terminator, then the prompt
    const OVERLONG_LINE: &[u8] = b"410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C\
410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C\
410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C\
410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C410D3C\r>";

    #[tokio::test(start_paused = true)]
    async fn test_overflowed_reply_is_a_failure() {
        let polling = PollingConfig {
            multi_pid_commands: vec!["010D".to_string()],
            ..Default::default()
        };
        let (adapter, session, mut controller, _link) = scripted(polling);
        adapter.queue(OVERLONG_LINE);
        assert_eq!(controller.tick().await, CycleOutcome::Completed);
        assert_eq!(controller.policy().delay_ms(), 225);
        assert_eq!(session.telemetry().snapshot().speed_kmh, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_falls_back_to_individual_requests() {
        let polling = PollingConfig {
            multi_pid_commands: vec!["01A5".to_string()],
            max_errors_at_max_delay: 100,
            ..Default::default()
        };
        let mut rig = rig(polling);
        reach(&mut rig.controller, PollerState::Polling).await;

        // the simulated ECU has nothing for PID A5
        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(5000) {
            assert_eq!(rig.controller.tick().await, CycleOutcome::Completed);
        }
        rig.controller.tick().await;
        assert_eq!(rig.controller.policy().mode(), PollingMode::IndividualPid);

        let tail: Vec<String> = rig.adapter.commands().into_iter().rev().take(3).collect();
        assert_eq!(tail, vec!["010D", "0111", "010C"]);
        assert_eq!(rig.session.telemetry().snapshot().rpm, 820);

        rig.shutdown.send(true).unwrap();
        rig.link_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_returns_to_wait_for_radio() {
        let rig = rig(PollingConfig::default());
        let status = rig.controller.subscribe();
        let adapter = rig.adapter.clone();
        let session = rig.session.clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = tokio::spawn(rig.controller.run(stop_rx));

        let mut watch_status = status.clone();
        watch_status
            .wait_for(|s| s.state == PollerState::Polling && s.cycles >= 2)
            .await
            .unwrap();

        let before = session.generation();
        adapter.drop_link("out of range");
        watch_status
            .wait_for(|s| s.state == PollerState::WaitForRadio)
            .await
            .unwrap();
        assert_ne!(session.state(), SessionState::AwaitingResponse);

        // the link manager reconnects and polling resumes on the new link
        watch_status
            .wait_for(|s| s.state == PollerState::Polling)
            .await
            .unwrap();
        // one bump for the drop, one for the new link
        assert_eq!(session.generation(), before + 2);

        stop_tx.send(true).unwrap();
        poller.await.unwrap();
        rig.shutdown.send(true).unwrap();
        rig.link_task.await.unwrap();
    }
}
