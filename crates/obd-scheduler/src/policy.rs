//! Adaptive polling policy
//!
//! Chooses the commands for each cycle, tunes the inter-command delay from
//! observed success and failure, and decides when the ECU is gone.

use obd_protocol::Pid;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// PIDs polled every cycle, in request order
const TELEMETRY_PIDS: [Pid; 3] = [Pid::Rpm, Pid::ThrottlePosition, Pid::Speed];

/// Configuration for the polling controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Delay floor and starting value (milliseconds)
    pub min_delay_ms: u64,
    /// Delay ceiling (milliseconds)
    pub max_delay_ms: u64,
    /// Decrease after a reply with data (milliseconds)
    pub success_step_ms: u64,
    /// Increase after a timeout or failure reply (milliseconds)
    pub failure_step_ms: u64,
    /// Failures at the ceiling before the ECU is declared lost
    pub max_errors_at_max_delay: u32,
    /// Reply window per command (milliseconds)
    pub response_timeout_ms: u64,
    /// Time without data before falling back to single-PID requests (milliseconds)
    pub stall_timeout_ms: u64,
    /// Complete single-PID cycles before returning to combined requests
    pub individual_cycles: u32,
    /// Telemetry freshness in combined mode (milliseconds)
    pub multi_pid_freshness_ms: u64,
    /// Telemetry freshness in single-PID mode (milliseconds)
    pub individual_freshness_ms: u64,
    /// Commands issued per cycle in combined mode
    pub multi_pid_commands: Vec<String>,
    /// Commands issued per cycle in single-PID mode
    pub individual_commands: Vec<String>,
    /// Consecutive `SEARCHING...` replies tolerated before a request is reissued
    pub searching_retry_threshold: u32,
    /// Pause before re-verifying an unresponsive ECU (milliseconds)
    pub reverify_delay_ms: u64,
    /// Pause before retrying a failed session initialization (milliseconds)
    pub init_retry_delay_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 175,
            max_delay_ms: 500,
            success_step_ms: 5,
            failure_step_ms: 50,
            max_errors_at_max_delay: 10,
            response_timeout_ms: 1000,
            stall_timeout_ms: 5000,
            individual_cycles: 3,
            multi_pid_freshness_ms: 600,
            individual_freshness_ms: 1000,
            multi_pid_commands: vec![Pid::combined_request(&TELEMETRY_PIDS)],
            individual_commands: TELEMETRY_PIDS.iter().map(Pid::request).collect(),
            searching_retry_threshold: 3,
            reverify_delay_ms: 10_000,
            init_retry_delay_ms: 2_000,
        }
    }
}

impl PollingConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn reverify_delay(&self) -> Duration {
        Duration::from_millis(self.reverify_delay_ms)
    }

    pub fn init_retry_delay(&self) -> Duration {
        Duration::from_millis(self.init_retry_delay_ms)
    }
}

/// Request strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PollingMode {
    /// One combined command per cycle
    #[default]
    MultiPid,
    /// RPM, throttle and speed as separate commands
    IndividualPid,
}

/// What a failure means for the ECU connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    Continue,
    /// Error budget at the delay ceiling is spent
    EcuLost,
}

/// Delay, mode and error bookkeeping for the polling loop
#[derive(Debug, Clone)]
pub struct PollingPolicy {
    config: PollingConfig,
    mode: PollingMode,
    delay_ms: u64,
    errors_at_max_delay: u32,
    /// Consecutive `UNABLE TO CONNECT` replies: adapter up, ECU silent
    unable_to_connect: u32,
    cycles_in_individual_mode: u32,
    /// Last reply with data, or when polling (re)started
    last_progress: Instant,
}

impl PollingPolicy {
    pub fn new(config: PollingConfig) -> Self {
        let max_delay_ms = config.max_delay_ms.max(config.min_delay_ms);
        let config = PollingConfig {
            max_delay_ms,
            ..config
        };
        Self {
            delay_ms: config.min_delay_ms,
            config,
            mode: PollingMode::MultiPid,
            errors_at_max_delay: 0,
            unable_to_connect: 0,
            cycles_in_individual_mode: 0,
            last_progress: Instant::now(),
        }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    pub fn mode(&self) -> PollingMode {
        self.mode
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn errors_at_max_delay(&self) -> u32 {
        self.errors_at_max_delay
    }

    pub fn unable_to_connect_count(&self) -> u32 {
        self.unable_to_connect
    }

    /// Fresh start after (re)verification
    pub fn reset(&mut self, now: Instant) {
        self.mode = PollingMode::MultiPid;
        self.delay_ms = self.config.min_delay_ms;
        self.errors_at_max_delay = 0;
        self.unable_to_connect = 0;
        self.cycles_in_individual_mode = 0;
        self.last_progress = now;
    }

    /// A reply carried decoded data
    pub fn record_success(&mut self, now: Instant) {
        self.delay_ms = self
            .delay_ms
            .saturating_sub(self.config.success_step_ms)
            .max(self.config.min_delay_ms);
        self.errors_at_max_delay = 0;
        self.unable_to_connect = 0;
        self.last_progress = now;
    }

    /// The adapter answered `UNABLE TO CONNECT`.
    ///
    /// Only counted here; the reply still goes through
    /// [`PollingPolicy::record_failure`] like any other failure.
    pub fn record_unable_to_connect(&mut self) {
        self.unable_to_connect += 1;
        if self.unable_to_connect == 1 {
            info!("Adapter answering but ECU silent (UNABLE TO CONNECT)");
        }
    }

    /// A request timed out or the adapter answered with a failure
    pub fn record_failure(&mut self) -> FailureVerdict {
        if self.delay_ms >= self.config.max_delay_ms {
            self.errors_at_max_delay += 1;
            if self.errors_at_max_delay >= self.config.max_errors_at_max_delay {
                self.errors_at_max_delay = 0;
                return FailureVerdict::EcuLost;
            }
        } else {
            self.delay_ms = (self.delay_ms + self.config.failure_step_ms).min(self.config.max_delay_ms);
        }
        FailureVerdict::Continue
    }

    /// Fall back to single-PID requests once data has stalled
    pub fn update_mode(&mut self, now: Instant) {
        let stalled = now.saturating_duration_since(self.last_progress)
            >= Duration::from_millis(self.config.stall_timeout_ms);
        if self.mode == PollingMode::MultiPid && stalled {
            warn!(
                "No telemetry for {}ms, switching to individual PID requests",
                self.config.stall_timeout_ms
            );
            self.mode = PollingMode::IndividualPid;
            self.cycles_in_individual_mode = 0;
        }
    }

    /// Commands for the next cycle, in order
    pub fn next_commands(&self) -> &[String] {
        match self.mode {
            PollingMode::MultiPid => &self.config.multi_pid_commands,
            PollingMode::IndividualPid => &self.config.individual_commands,
        }
    }

    /// Count a completed cycle; leaves single-PID mode after enough of them
    pub fn finish_cycle(&mut self, now: Instant) {
        if self.mode != PollingMode::IndividualPid {
            return;
        }
        self.cycles_in_individual_mode += 1;
        if self.cycles_in_individual_mode >= self.config.individual_cycles {
            info!(
                "Completed {} individual PID cycles, returning to multi-PID requests",
                self.cycles_in_individual_mode
            );
            self.mode = PollingMode::MultiPid;
            self.cycles_in_individual_mode = 0;
            self.last_progress = now;
        }
    }

    /// Maximum telemetry age for the active mode
    pub fn freshness(&self) -> Duration {
        let ms = match self.mode {
            PollingMode::MultiPid => self.config.multi_pid_freshness_ms,
            PollingMode::IndividualPid => self.config.individual_freshness_ms,
        };
        Duration::from_millis(ms)
    }
}
