//! ELM327 Command Session
//!
//! Formats AT/OBD commands, paces them against the adapter's `>` prompt and
//! routes parsed replies back to whoever issued the command. One command is
//! outstanding at a time: the event receiver is locked for the lifetime of
//! an [`Exchange`].

use crate::error::{AdapterFault, ObdError};
use crate::parser::{DecodedFrame, ParsedEvent, Response, ResponseParser, DEFAULT_MAX_LINE};
use crate::protocol::ObdProtocol;
use crate::status::EcuStatus;
use crate::telemetry::TelemetryStore;
use crate::transport::{LinkListener, Transport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, MutexGuard};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Session lifecycle, one per radio connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Initializing,
    ReadyForCommand,
    AwaitingResponse,
}

/// Whether a send waits for the adapter prompt first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Wait (bounded) for `>` before writing
    AwaitPrompt,
    /// Write straight away
    Immediate,
}

/// The command currently on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    /// Command text without terminator
    pub text: String,
    /// Sent with [`Pacing::AwaitPrompt`]
    pub expects_prompt: bool,
    /// When the write was issued
    pub sent_at: Instant,
}

/// One command of the initialization sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitStep {
    pub command: String,
    pub pacing: Pacing,
    pub settle: Duration,
}

/// Command session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bounded wait for the `>` prompt before sending anyway (milliseconds)
    pub prompt_timeout_ms: u64,

    /// Reply window for each initialization command (milliseconds)
    pub init_response_timeout_ms: u64,

    /// Quiet period after the link comes up, before `ATZ` (milliseconds)
    pub link_settle_ms: u64,

    /// Delay between initialization commands (milliseconds)
    pub settle_ms: u64,

    /// Delay after `ATZ` while the adapter reboots (milliseconds)
    pub reset_settle_ms: u64,

    /// Protocol selected with `ATSP`
    pub protocol: ObdProtocol,

    /// Request header set with `AT SH`
    pub header: String,

    /// Adapter response timeout set with `AT ST`, in units of 4 ms
    pub adapter_timeout: u8,

    /// Longest unterminated line kept before it is discarded
    pub max_line_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prompt_timeout_ms: 2000,
            init_response_timeout_ms: 4000,
            link_settle_ms: 3000,
            settle_ms: 200,
            reset_settle_ms: 1000,
            protocol: ObdProtocol::Auto,
            header: "7DF".to_string(),
            adapter_timeout: 0x32,
            max_line_bytes: DEFAULT_MAX_LINE,
        }
    }
}

impl SessionConfig {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }

    pub fn init_response_timeout(&self) -> Duration {
        Duration::from_millis(self.init_response_timeout_ms)
    }

    pub fn link_settle(&self) -> Duration {
        Duration::from_millis(self.link_settle_ms)
    }

    /// Ordered AT configuration commands followed by the Mode 01 probe
    pub fn init_sequence(&self) -> Vec<InitStep> {
        let settle = Duration::from_millis(self.settle_ms);
        let step = |command: String| InitStep {
            command,
            pacing: Pacing::AwaitPrompt,
            settle,
        };

        let mut steps = vec![InitStep {
            command: "ATZ".to_string(),
            pacing: Pacing::Immediate,
            settle: Duration::from_millis(self.reset_settle_ms),
        }];
        steps.extend(
            [
                "ATE0".to_string(),
                "ATL0".to_string(),
                "ATH0".to_string(),
                "ATS0".to_string(),
                self.protocol.to_elm_command(),
                "AT AL".to_string(),
                format!("AT SH {}", self.header),
                "AT CAF1".to_string(),
                format!("AT ST {:02X}", self.adapter_timeout),
                "AT RV".to_string(),
                "AT DPN".to_string(),
                "0100".to_string(),
            ]
            .into_iter()
            .map(step),
        );
        steps
    }
}

/// Events routed from the receive path to the waiting command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Reply(Response),
    Frame(DecodedFrame),
    Prompt,
    Overflow(usize),
    LinkLost,
}

/// Everything received for one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Control and informational lines
    pub responses: Vec<Response>,
    /// Decoded Mode 01 frames
    pub frames: Vec<DecodedFrame>,
    /// The adapter prompt ended the reply
    pub completed: bool,
    /// Bytes discarded when a line overflowed the receive buffer
    pub overflowed: Option<usize>,
}

impl Reply {
    /// At least one PID was decoded
    pub fn has_data(&self) -> bool {
        self.frames.iter().any(|f| !f.readings.is_empty())
    }

    /// First failure string in the reply
    pub fn fault(&self) -> Option<AdapterFault> {
        self.responses.iter().find_map(Response::fault)
    }

    pub fn is_searching(&self) -> bool {
        self.responses.contains(&Response::Searching)
    }

    fn is_empty(&self) -> bool {
        self.responses.is_empty() && self.frames.is_empty()
    }
}

struct SessionInner {
    state: SessionState,
    parser: ResponseParser,
    pending: Option<PendingCommand>,
    ready: bool,
    link_up: bool,
}

/// Command/response primitive over the adapter link
pub struct CommandSession {
    /// Outbound byte path
    transport: Arc<dyn Transport>,
    /// Telemetry updated from decoded frames
    telemetry: Arc<TelemetryStore>,
    /// ECU connectivity flag
    ecu: Arc<EcuStatus>,
    /// Timing and init configuration
    config: SessionConfig,
    /// Mutable session state, touched by the receive path and by senders
    inner: Mutex<SessionInner>,
    /// Bumped on every link up and link down
    generation: AtomicU64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    /// Held by the single in-flight command
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl CommandSession {
    /// Create a session writing through `transport`
    pub fn new(
        transport: Arc<dyn Transport>,
        telemetry: Arc<TelemetryStore>,
        ecu: Arc<EcuStatus>,
        config: SessionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let parser = ResponseParser::new(config.max_line_bytes);
        Self {
            transport,
            telemetry,
            ecu,
            config,
            inner: Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                parser,
                pending: None,
                ready: false,
                link_up: false,
            }),
            generation: AtomicU64::new(0),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// The adapter has shown its prompt since the last send
    pub fn ready(&self) -> bool {
        self.inner.lock().ready
    }

    pub fn pending(&self) -> Option<PendingCommand> {
        self.inner.lock().pending.clone()
    }

    pub fn is_link_up(&self) -> bool {
        self.inner.lock().link_up
    }

    /// Current connection generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Fails with [`ObdError::Cancelled`] once `generation` is stale
    pub fn check_generation(&self, generation: u64) -> Result<(), ObdError> {
        let inner = self.inner.lock();
        if !inner.link_up || self.generation.load(Ordering::Acquire) != generation {
            return Err(ObdError::Cancelled(generation));
        }
        Ok(())
    }

    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    pub fn ecu(&self) -> &Arc<EcuStatus> {
        &self.ecu
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Send one command, returning the exchange that collects its reply.
    ///
    /// Waits for any outstanding exchange to be dropped first.
    pub async fn send(&self, command: &str, pacing: Pacing) -> Result<Exchange<'_>, ObdError> {
        let mut rx = self.events_rx.lock().await;
        let generation = self.generation();
        if !self.is_link_up() {
            return Err(ObdError::NotConnected);
        }

        if pacing == Pacing::AwaitPrompt && !self.ready() {
            let deadline = Instant::now() + self.config.prompt_timeout();
            if !wait_for_prompt(&mut rx, deadline).await {
                if self.state() == SessionState::Initializing {
                    debug!("No prompt before {}, sending anyway", command);
                } else {
                    warn!(
                        "No prompt within {}ms before {}, pacing degraded",
                        self.config.prompt_timeout_ms, command
                    );
                }
            }
        }

        // replies to earlier commands must not leak into this exchange
        while let Ok(stale) = rx.try_recv() {
            debug!("Discarding stale event {:?}", stale);
        }

        {
            let mut inner = self.inner.lock();
            if !inner.link_up || self.generation.load(Ordering::Acquire) != generation {
                return Err(ObdError::Cancelled(generation));
            }
            inner.ready = false;
            inner.pending = Some(PendingCommand {
                text: command.to_string(),
                expects_prompt: pacing == Pacing::AwaitPrompt,
                sent_at: Instant::now(),
            });
            if inner.state == SessionState::ReadyForCommand {
                inner.state = SessionState::AwaitingResponse;
            }
        }

        let exchange = Exchange {
            session: self,
            rx,
            generation,
        };

        debug!("SEND {}", command);
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\r');
        self.transport.write(&line).await?;

        Ok(exchange)
    }

    /// Send and collect the reply within `limit`
    pub async fn transact(
        &self,
        command: &str,
        pacing: Pacing,
        limit: Duration,
    ) -> Result<Reply, ObdError> {
        let mut exchange = self.send(command, pacing).await?;
        exchange.finish(limit).await
    }

    /// Run the AT initialization sequence on a fresh link
    pub async fn initialize(&self) -> Result<(), ObdError> {
        let generation = self.generation();
        {
            let mut inner = self.inner.lock();
            if !inner.link_up || self.generation.load(Ordering::Acquire) != generation {
                return Err(ObdError::NotConnected);
            }
            inner.state = SessionState::Initializing;
        }
        info!("Initializing ELM327 session (generation {})", generation);

        sleep(self.config.link_settle()).await;
        self.check_generation(generation)?;

        for step in self.config.init_sequence() {
            let result = self
                .transact(&step.command, step.pacing, self.config.init_response_timeout())
                .await;
            match result {
                Ok(reply) => self.log_init_reply(&step.command, &reply),
                Err(e @ (ObdError::Transport(_) | ObdError::NotConnected | ObdError::Cancelled(_))) => {
                    warn!("Initialization aborted at {}: {}", step.command, e);
                    self.abandon(generation);
                    return Err(e);
                }
                Err(e) => warn!("Init command {} failed: {}", step.command, e),
            }

            sleep(step.settle).await;
            self.check_generation(generation)?;
        }

        {
            let mut inner = self.inner.lock();
            if self.generation.load(Ordering::Acquire) != generation {
                return Err(ObdError::Cancelled(generation));
            }
            inner.state = SessionState::ReadyForCommand;
            inner.ready = true;
        }
        info!("ELM327 session ready");
        Ok(())
    }

    fn log_init_reply(&self, command: &str, reply: &Reply) {
        if let Some(fault) = reply.fault() {
            warn!("Init command {} answered {}", command, fault);
            return;
        }
        for response in &reply.responses {
            match response {
                Response::Identification(banner) => info!("Adapter identified as {}", banner),
                Response::Info(text) if command == "AT DPN" => match ObdProtocol::from_dpn(text) {
                    Some((protocol, true)) => info!("Adapter auto-selected {:?}", protocol),
                    Some((protocol, false)) => info!("Adapter using {:?}", protocol),
                    None => debug!("Unrecognized protocol reply {}", text),
                },
                Response::Info(text) if command == "AT RV" => info!("Adapter supply voltage {}", text),
                _ => {}
            }
        }
    }

    /// Drop back to Uninitialized if `generation` is still current
    fn abandon(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if self.generation.load(Ordering::Acquire) == generation {
            inner.state = SessionState::Uninitialized;
            inner.pending = None;
            inner.ready = false;
        }
    }

    fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        inner.pending = None;
        if inner.state == SessionState::AwaitingResponse {
            inner.state = SessionState::ReadyForCommand;
        }
    }

    fn emit(&self, event: SessionEvent) {
        // the receiver lives as long as the session
        let _ = self.events_tx.send(event);
    }
}

impl LinkListener for CommandSession {
    fn on_link_up(&self, link_generation: u64) {
        let mut inner = self.inner.lock();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        inner.parser.reset();
        inner.state = SessionState::Uninitialized;
        inner.pending = None;
        inner.ready = false;
        inner.link_up = true;
        info!(
            "Command session attached to link {} (session generation {})",
            link_generation, generation
        );
    }

    fn on_bytes(&self, bytes: &[u8]) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if !inner.link_up {
            return;
        }
        for event in inner.parser.feed(bytes) {
            match event {
                ParsedEvent::Frame(frame) => {
                    for value in frame.values() {
                        self.telemetry.apply(value, now);
                    }
                    debug!("RECV frame with {} PIDs", frame.readings.len());
                    self.emit(SessionEvent::Frame(frame));
                }
                ParsedEvent::Reply(response) => {
                    debug!("RECV {}", response);
                    self.emit(SessionEvent::Reply(response));
                }
                ParsedEvent::Prompt => {
                    inner.ready = true;
                    if inner.state == SessionState::AwaitingResponse {
                        inner.state = SessionState::ReadyForCommand;
                        inner.pending = None;
                    }
                    self.emit(SessionEvent::Prompt);
                }
                ParsedEvent::Overflow(len) => {
                    warn!("Receive buffer overflow, discarded {} bytes", len);
                    self.emit(SessionEvent::Overflow(len));
                }
            }
        }
    }

    fn on_link_down(&self) {
        {
            let mut inner = self.inner.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
            inner.state = SessionState::Uninitialized;
            inner.pending = None;
            inner.ready = false;
            inner.link_up = false;
            inner.parser.reset();
        }
        self.ecu.link_lost();
        self.telemetry.clear();
        self.emit(SessionEvent::LinkLost);
        info!("Command session detached from link");
    }
}

async fn wait_for_prompt(rx: &mut mpsc::UnboundedReceiver<SessionEvent>, deadline: Instant) -> bool {
    loop {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(SessionEvent::Prompt)) => return true,
            Ok(Some(SessionEvent::LinkLost)) | Ok(None) | Err(_) => return false,
            Ok(Some(_)) => {}
        }
    }
}

/// The single in-flight command and its reply stream.
///
/// Dropping the exchange frees the session for the next command.
pub struct Exchange<'a> {
    session: &'a CommandSession,
    rx: MutexGuard<'a, mpsc::UnboundedReceiver<SessionEvent>>,
    generation: u64,
}

impl Exchange<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Next event for this command, `None` once `deadline` passes
    pub async fn next_event(&mut self, deadline: Instant) -> Result<Option<SessionEvent>, ObdError> {
        match timeout_at(deadline, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(None) | Ok(Some(SessionEvent::LinkLost)) => Err(ObdError::Cancelled(self.generation)),
            Ok(Some(event)) => {
                self.session.check_generation(self.generation)?;
                Ok(Some(event))
            }
        }
    }

    /// Collect events until the prompt or `limit`.
    ///
    /// A timeout with nothing received is [`ObdError::Timeout`]; a partial
    /// reply is returned with `completed == false`.
    pub async fn finish(&mut self, limit: Duration) -> Result<Reply, ObdError> {
        let deadline = Instant::now() + limit;
        let mut reply = Reply::default();
        loop {
            match self.next_event(deadline).await? {
                Some(SessionEvent::Prompt) => {
                    reply.completed = true;
                    return Ok(reply);
                }
                Some(SessionEvent::Reply(response)) => reply.responses.push(response),
                Some(SessionEvent::Frame(frame)) => reply.frames.push(frame),
                Some(SessionEvent::Overflow(len)) => reply.overflowed = Some(len),
                Some(SessionEvent::LinkLost) => return Err(ObdError::Cancelled(self.generation)),
                None if reply.is_empty() => {
                    return Err(ObdError::Timeout(limit.as_millis() as u64));
                }
                None => return Ok(reply),
            }
        }
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        self.session.release(self.generation);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pid::TelemetryValue;
    use async_trait::async_trait;

    /// Records writes; replies are injected by the test through `on_bytes`
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub writes: Mutex<Vec<String>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingTransport {
        pub fn sent(&self) -> Vec<String> {
            self.writes.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn write(&self, bytes: &[u8]) -> Result<(), ObdError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(ObdError::Transport("write refused".into()));
            }
            let text = String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string();
            self.writes.lock().push(text);
            Ok(())
        }
    }

    pub(crate) fn session_with(transport: Arc<RecordingTransport>) -> Arc<CommandSession> {
        let config = SessionConfig {
            link_settle_ms: 0,
            settle_ms: 0,
            reset_settle_ms: 0,
            ..Default::default()
        };
        let session = Arc::new(CommandSession::new(
            transport,
            Arc::new(TelemetryStore::new()),
            Arc::new(EcuStatus::new()),
            config,
        ));
        session.on_link_up(1);
        session
    }

    /// Mark the session initialized without running the AT sequence
    pub(crate) fn make_ready(session: &CommandSession) {
        let mut inner = session.inner.lock();
        inner.state = SessionState::ReadyForCommand;
        inner.ready = true;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_appends_terminator_and_collects_reply() {
        let transport = Arc::new(RecordingTransport::default());
        let session = session_with(transport.clone());
        make_ready(&session);

        let mut exchange = session.send("010D", Pacing::AwaitPrompt).await.unwrap();
        assert_eq!(session.state(), SessionState::AwaitingResponse);
        assert_eq!(session.pending().map(|p| p.text), Some("010D".to_string()));

        session.on_bytes(b"41 0D 3C\r\r>");
        let reply = exchange.finish(Duration::from_millis(1000)).await.unwrap();
        drop(exchange);

        assert!(reply.completed);
        assert!(reply.has_data());
        assert_eq!(transport.sent(), vec!["010D"]);
        assert_eq!(session.telemetry().snapshot().speed_kmh, 60);
        assert_eq!(session.state(), SessionState::ReadyForCommand);
        assert!(session.pending().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_wait_times_out_and_sends_anyway() {
        let transport = Arc::new(RecordingTransport::default());
        let session = session_with(transport.clone());
        {
            let mut inner = session.inner.lock();
            inner.state = SessionState::ReadyForCommand;
        }
        assert!(!session.ready());

        let started = Instant::now();
        let exchange = session.send("010C", Pacing::AwaitPrompt).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(2000));
        drop(exchange);
        assert_eq!(transport.sent(), vec!["010C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_send_skips_prompt_wait() {
        let transport = Arc::new(RecordingTransport::default());
        let session = session_with(transport.clone());

        let started = Instant::now();
        let exchange = session.send("0100", Pacing::Immediate).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        drop(exchange);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_reply() {
        let transport = Arc::new(RecordingTransport::default());
        let session = session_with(transport);
        make_ready(&session);

        let result = session
            .transact("010C", Pacing::AwaitPrompt, Duration::from_millis(1000))
            .await;
        assert!(matches!(result, Err(ObdError::Timeout(1000))));
        assert_eq!(session.state(), SessionState::ReadyForCommand);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_reply_is_not_data() {
        let transport = Arc::new(RecordingTransport::default());
        let session = session_with(transport);
        make_ready(&session);

        let mut exchange = session.send("010C", Pacing::AwaitPrompt).await.unwrap();
        session.on_bytes(b"NO DATA\r\r>");
        let reply = exchange.finish(Duration::from_millis(1000)).await.unwrap();
        assert!(!reply.has_data());
        assert_eq!(reply.fault(), Some(AdapterFault::NoData));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_wait_cancels_and_resets() {
        let transport = Arc::new(RecordingTransport::default());
        let session = session_with(transport);
        make_ready(&session);
        session.telemetry().apply(TelemetryValue::Rpm(900), Instant::now());

        let mut exchange = session.send("010C", Pacing::AwaitPrompt).await.unwrap();
        assert_eq!(session.state(), SessionState::AwaitingResponse);

        let waiter = session.clone();
        let disconnect = tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            waiter.on_link_down();
        });

        let result = exchange.finish(Duration::from_millis(1000)).await;
        assert!(matches!(result, Err(ObdError::Cancelled(_))));
        drop(exchange);
        disconnect.await.unwrap();

        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(session.pending().is_none());
        assert_eq!(session.telemetry().snapshot().rpm, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_link_fails() {
        let transport = Arc::new(RecordingTransport::default());
        let session = session_with(transport);
        session.on_link_down();
        let result = session.send("010C", Pacing::Immediate).await;
        assert!(matches!(result, Err(ObdError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_releases_slot() {
        let transport = Arc::new(RecordingTransport::default());
        transport.fail.store(true, Ordering::Relaxed);
        let session = session_with(transport);
        make_ready(&session);

        let result = session.send("010C", Pacing::AwaitPrompt).await;
        assert!(matches!(result, Err(ObdError::Transport(_))));
        assert_eq!(session.state(), SessionState::ReadyForCommand);
        assert!(session.pending().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_sends_sequence_in_order() {
        let transport = Arc::new(RecordingTransport::default());
        let session = session_with(transport.clone());

        let responder = session.clone();
        let feeder = transport.clone();
        let answer = tokio::spawn(async move {
            let mut answered = 0;
            loop {
                sleep(Duration::from_millis(10)).await;
                let sent = feeder.sent();
                while answered < sent.len() {
                    let reply: &[u8] = match sent[answered].as_str() {
                        "ATZ" => b"\r\rELM327 v1.5\r\r>",
                        "AT RV" => b"12.6V\r\r>",
                        "AT DPN" => b"A6\r\r>",
                        "0100" => b"SEARCHING...\r41 00 BE 3E B8 11\r\r>",
                        _ => b"OK\r\r>",
                    };
                    responder.on_bytes(reply);
                    answered += 1;
                }
                if answered == 13 {
                    break;
                }
            }
        });

        session.initialize().await.unwrap();
        answer.await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent[0], "ATZ");
        assert_eq!(sent[1], "ATE0");
        assert_eq!(sent.last().map(String::as_str), Some("0100"));
        assert!(sent.contains(&"AT SH 7DF".to_string()));
        assert!(sent.contains(&"AT ST 32".to_string()));
        assert_eq!(session.state(), SessionState::ReadyForCommand);
        assert!(session.ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_aborts_on_link_loss() {
        let transport = Arc::new(RecordingTransport::default());
        let session = session_with(transport);

        let dropper = session.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            dropper.on_link_down();
        });

        let result = session.initialize().await;
        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_init_sequence_uses_configured_protocol() {
        let config = SessionConfig {
            protocol: ObdProtocol::Iso15765_4Can11bit500,
            ..Default::default()
        };
        let commands: Vec<_> = config
            .init_sequence()
            .into_iter()
            .map(|s| s.command)
            .collect();
        assert!(commands.contains(&"ATSP6".to_string()));
        assert_eq!(commands.len(), 13);
        let spaces = commands.iter().position(|c| c == "ATS0");
        let headers = commands.iter().position(|c| c == "ATH0");
        assert_eq!(spaces, headers.map(|i| i + 1));
    }
}
