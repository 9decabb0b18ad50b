use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    Completed,
    FailedPermanently,
}

impl JobStatus {
    /// Completed and permanently failed jobs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::FailedPermanently)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Assigned => write!(f, "assigned"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::FailedPermanently => write!(f, "failed_permanently"),
        }
    }
}

/// Submission parameters for a new transcoding job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub source_url: String,
    pub target_codec: String,
    pub job_size: f64,
    pub max_retries: u32,
}

impl JobRequest {
    pub fn new(
        source_url: impl Into<String>,
        target_codec: impl Into<String>,
        job_size: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            target_codec: target_codec.into(),
            job_size,
            max_retries,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_url.trim().is_empty() {
            return Err(DispatchError::InvalidInput(
                "source_url must not be empty".to_string(),
            ));
        }
        if self.target_codec.trim().is_empty() {
            return Err(DispatchError::InvalidInput(
                "target_codec must not be empty".to_string(),
            ));
        }
        if !self.job_size.is_finite() || self.job_size < 0.0 {
            return Err(DispatchError::InvalidInput(format!(
                "job_size must be a non-negative number, got {}",
                self.job_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source_url: String,
    pub target_codec: String,
    pub job_size: f64,
    pub status: JobStatus,
    pub assigned_engine: Option<String>,
    /// Engine that most recently held the job. Unlike `assigned_engine` it
    /// survives completion and failure.
    #[serde(default)]
    pub last_engine: Option<String>,
    pub output_url: Option<String>,
    pub retries: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_url: request.source_url,
            target_codec: request.target_codec,
            job_size: request.job_size,
            status: JobStatus::Pending,
            assigned_engine: None,
            last_engine: None,
            output_url: None,
            retries: 0,
            max_retries: request.max_retries,
            error_message: None,
            created_at: now,
            updated_at: now,
            assigned_at: None,
        }
    }

    /// Check the field invariants tied to the lifecycle state.
    ///
    /// `assigned_engine` and `assigned_at` are present iff the job is assigned,
    /// `output_url` is present iff it is completed, and the retry count stays
    /// within bounds until the job fails permanently.
    pub fn check_invariants(&self) -> Result<()> {
        let assigned = self.status == JobStatus::Assigned;
        let completed = self.status == JobStatus::Completed;

        let violation = if self.assigned_engine.is_some() != assigned {
            Some("assigned_engine must be set iff status is assigned")
        } else if self.assigned_at.is_some() != assigned {
            Some("assigned_at must be set iff status is assigned")
        } else if self.output_url.is_some() != completed {
            Some("output_url must be set iff status is completed")
        } else if self.status != JobStatus::FailedPermanently && self.retries > self.max_retries {
            Some("retries exceed max_retries")
        } else {
            None
        };

        match violation {
            Some(msg) => Err(DispatchError::InvalidInput(format!(
                "job {} ({}): {}",
                self.id, self.status, msg
            ))),
            None => Ok(()),
        }
    }
}
