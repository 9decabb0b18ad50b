use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::assigner::{AssignmentScheduler, DEFAULT_SMALL_JOB_THRESHOLD};
use crate::store::DEFAULT_STATE_FILE;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Exponential backoff for the assignment loop while work is pending but no
/// engine can take it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 5_000,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let ms = self.initial_ms.saturating_mul(factor).min(self.max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Where the state document lives.
    pub state_file: PathBuf,
    pub listen_addr: SocketAddr,
    /// Jobs below this size go to the slowest eligible engine.
    pub small_job_threshold: f64,
    /// Used when a submission does not carry its own retry bound.
    pub default_max_retries: u32,
    /// Engines silent for longer than this are not assigned work.
    /// `None` disables the check.
    pub engine_timeout_ms: Option<u64>,
    /// Assigned jobs older than this are failed through the retry policy.
    /// `None` disables the check.
    pub job_timeout_ms: Option<u64>,
    pub assign_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            small_job_threshold: DEFAULT_SMALL_JOB_THRESHOLD,
            default_max_retries: DEFAULT_MAX_RETRIES,
            engine_timeout_ms: Some(5 * 60 * 1000),
            job_timeout_ms: Some(30 * 60 * 1000),
            assign_interval_ms: 1_000,
            sweep_interval_ms: 30_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            ..Default::default()
        }
    }

    pub fn with_listen_addr(mut self, listen_addr: SocketAddr) -> Self {
        self.listen_addr = listen_addr;
        self
    }

    pub fn with_small_job_threshold(mut self, threshold: f64) -> Self {
        self.small_job_threshold = threshold;
        self
    }

    pub fn engine_timeout(&self) -> Option<Duration> {
        self.engine_timeout_ms.map(Duration::from_millis)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }

    pub fn scheduler(&self) -> AssignmentScheduler {
        AssignmentScheduler::new(self.small_job_threshold)
            .with_engine_timeout(self.engine_timeout())
    }
}
