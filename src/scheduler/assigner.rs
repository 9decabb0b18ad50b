use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::engine::{Engine, EngineRegistry};
use crate::scheduler::queue::JobRegistry;

/// Jobs smaller than this go to the slowest eligible engine.
pub const DEFAULT_SMALL_JOB_THRESHOLD: f64 = 50.0;

/// Result of one assignment pass. The no-op variants are normal outcomes,
/// not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Assigned { job_id: Uuid, engine_id: String },
    NoPendingJobs,
    NoEligibleEngines { job_id: Uuid },
}

impl AssignmentOutcome {
    pub fn is_assigned(&self) -> bool {
        matches!(self, AssignmentOutcome::Assigned { .. })
    }
}

/// Greedy single-pair matcher: one pending job, one engine, per pass.
///
/// Small jobs are sent to the slowest idle engine so the fast machines stay
/// free for large jobs; everything else goes to the fastest idle engine.
#[derive(Debug, Clone)]
pub struct AssignmentScheduler {
    small_job_threshold: f64,
    engine_timeout: Option<Duration>,
}

impl Default for AssignmentScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SMALL_JOB_THRESHOLD)
    }
}

impl AssignmentScheduler {
    pub fn new(small_job_threshold: f64) -> Self {
        Self {
            small_job_threshold,
            engine_timeout: None,
        }
    }

    /// Skip engines that have not sent a heartbeat within `timeout`.
    pub fn with_engine_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.engine_timeout = timeout;
        self
    }

    pub fn small_job_threshold(&self) -> f64 {
        self.small_job_threshold
    }

    /// Pick an engine for a job of `job_size` from the eligible set.
    ///
    /// Candidates are ordered fastest first; the sort is stable so equal
    /// benchmark times keep registry order.
    pub fn select_engine<'a>(
        &self,
        job_size: f64,
        mut eligible: Vec<&'a Engine>,
    ) -> Option<&'a Engine> {
        eligible.sort_by(|a, b| {
            let a = a.benchmark_time.unwrap_or(f64::INFINITY);
            let b = b.benchmark_time.unwrap_or(f64::INFINITY);
            a.total_cmp(&b)
        });

        if job_size < self.small_job_threshold {
            eligible.last().copied()
        } else {
            eligible.first().copied()
        }
    }

    pub fn assign_next(
        &self,
        jobs: &mut JobRegistry,
        engines: &mut EngineRegistry,
    ) -> Result<AssignmentOutcome> {
        self.assign_next_at(jobs, engines, Utc::now())
    }

    /// Run one assignment pass against the registries.
    ///
    /// Both registries are mutated in place; callers that need the pass to be
    /// all-or-nothing run it against a staged copy.
    pub fn assign_next_at(
        &self,
        jobs: &mut JobRegistry,
        engines: &mut EngineRegistry,
        now: DateTime<Utc>,
    ) -> Result<AssignmentOutcome> {
        let (job_id, job_size) = match jobs.first_pending() {
            Some(job) => (job.id, job.job_size),
            None => return Ok(AssignmentOutcome::NoPendingJobs),
        };

        let eligible: Vec<&Engine> = engines
            .list_idle_benchmarked()
            .into_iter()
            .filter(|e| match self.engine_timeout {
                Some(timeout) => e.is_alive(now, timeout),
                None => true,
            })
            .collect();

        let engine_id = match self.select_engine(job_size, eligible) {
            Some(engine) => engine.id.clone(),
            None => return Ok(AssignmentOutcome::NoEligibleEngines { job_id }),
        };

        jobs.mark_assigned(&job_id, &engine_id)?;
        engines.mark_busy(&engine_id, job_id)?;

        tracing::info!(job_id = %job_id, engine_id = %engine_id, job_size, "Job assigned");
        Ok(AssignmentOutcome::Assigned { job_id, engine_id })
    }
}
