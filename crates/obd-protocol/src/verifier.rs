//! ECU Connectivity Verifier
//!
//! Confirms the vehicle, not just the adapter, answers Mode 01 by probing
//! the supported-PIDs bitmap (`0100`) with bounded retries.

use crate::error::{AdapterFault, ObdError};
use crate::parser::Response;
use crate::pid::Pid;
use crate::session::{CommandSession, Pacing, SessionEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Supported-PIDs probe
pub const PROBE_COMMAND: &str = "0100";

/// Verifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Probes per `verify()` call
    pub max_attempts: u32,
    /// Reply window for one probe (milliseconds)
    pub attempt_timeout_ms: u64,
    /// Delay between probes (milliseconds)
    pub retry_delay_ms: u64,
    /// How many `SEARCHING...` lines may restart the reply window
    pub max_searching_extensions: u32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            attempt_timeout_ms: 4000,
            retry_delay_ms: 2000,
            max_searching_extensions: 3,
        }
    }
}

impl VerifierConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Result of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// `41 00 ...` received
    Verified,
    /// The adapter answered with a failure string
    Refused(AdapterFault),
    /// Nothing useful before the window closed
    NoAnswer,
}

/// Bounded-retry ECU handshake
pub struct EcuVerifier {
    session: Arc<CommandSession>,
    config: VerifierConfig,
}

impl EcuVerifier {
    pub fn new(session: Arc<CommandSession>, config: VerifierConfig) -> Self {
        Self { session, config }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Send one `0100` probe without waiting for the prompt
    pub async fn probe(&self) -> Result<ProbeOutcome, ObdError> {
        let mut exchange = self.session.send(PROBE_COMMAND, Pacing::Immediate).await?;
        let mut deadline = Instant::now() + self.config.attempt_timeout();
        let mut extensions = 0;

        loop {
            match exchange.next_event(deadline).await? {
                None => return Ok(ProbeOutcome::NoAnswer),
                Some(SessionEvent::Frame(frame)) if frame.contains_pid(Pid::SupportedPids.as_hex()) => {
                    return Ok(ProbeOutcome::Verified);
                }
                Some(SessionEvent::Reply(Response::Searching)) => {
                    if extensions < self.config.max_searching_extensions {
                        extensions += 1;
                        deadline = Instant::now() + self.config.attempt_timeout();
                        debug!("Adapter searching for protocol, extending probe window");
                    }
                }
                Some(SessionEvent::Reply(response)) => {
                    if let Some(fault) = response.fault() {
                        return Ok(ProbeOutcome::Refused(fault));
                    }
                }
                // a bare prompt is left over from an earlier command
                Some(_) => {}
            }
        }
    }

    /// Probe until the ECU answers or the attempts run out.
    ///
    /// Marks the ECU connected on success. Returns false early when the
    /// link is lost.
    pub async fn verify(&self) -> bool {
        let max_attempts = self.config.max_attempts.max(1);
        info!("Verifying ECU connectivity (up to {} attempts)", max_attempts);

        for attempt in 1..=max_attempts {
            let generation = self.session.generation();
            match self.probe().await {
                Ok(ProbeOutcome::Verified) => {
                    self.session.ecu().mark_verified();
                    info!("ECU answered on attempt {}", attempt);
                    return true;
                }
                Ok(ProbeOutcome::Refused(fault)) => {
                    warn!("ECU probe {}/{} refused: {}", attempt, max_attempts, fault);
                }
                Ok(ProbeOutcome::NoAnswer) => {
                    warn!("ECU probe {}/{} got no answer", attempt, max_attempts);
                }
                Err(e) if e.is_link_loss() => {
                    warn!("ECU verification interrupted: {}", e);
                    return false;
                }
                Err(e) => warn!("ECU probe {}/{} failed: {}", attempt, max_attempts, e),
            }

            if attempt < max_attempts {
                sleep(self.config.retry_delay()).await;
                if self.session.check_generation(generation).is_err() {
                    warn!("Link changed during ECU verification");
                    return false;
                }
            }
        }

        warn!("ECU not answering after {} attempts", max_attempts);
        false
    }
}
