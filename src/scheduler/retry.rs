use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, JobStatus};

/// What a failure report did to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// The job went back to pending and can be assigned again.
    Requeued { retries: u32, max_retries: u32 },
    /// The retry budget is exhausted; the job is terminal.
    FailedPermanently { retries: u32, error_message: String },
}

/// Bounded-retry failure handling for assigned jobs.
///
/// Each failure consumes one retry. While `retries <= max_retries` the job is
/// requeued with the reason kept as its last error; the report that pushes it
/// past the bound finalizes it as permanently failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Apply a failure report to `job`. The job must currently be assigned.
    pub fn apply(
        &self,
        job: &mut Job,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        if job.status != JobStatus::Assigned {
            return Err(DispatchError::invalid_job_state(
                job.id,
                JobStatus::Assigned,
                job.status,
            ));
        }

        job.retries += 1;
        job.assigned_engine = None;
        job.assigned_at = None;
        job.updated_at = now;

        if job.retries <= job.max_retries {
            job.status = JobStatus::Pending;
            job.error_message = Some(error_message.to_string());
            tracing::warn!(
                job_id = %job.id,
                retries = job.retries,
                max_retries = job.max_retries,
                error = error_message,
                "Job failed, requeued"
            );
            Ok(FailureOutcome::Requeued {
                retries: job.retries,
                max_retries: job.max_retries,
            })
        } else {
            let message = format!(
                "Job failed permanently after {} attempts: {}",
                job.retries, error_message
            );
            job.status = JobStatus::FailedPermanently;
            job.error_message = Some(message.clone());
            tracing::info!(
                job_id = %job.id,
                retries = job.retries,
                error = error_message,
                "Job failed permanently"
            );
            Ok(FailureOutcome::FailedPermanently {
                retries: job.retries,
                error_message: message,
            })
        }
    }
}
