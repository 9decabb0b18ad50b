use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, JobRequest, JobStatus};
use crate::scheduler::retry::{FailureOutcome, RetryPolicy};

/// Number of jobs in each lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed_permanently: usize,
}

/// Owns job records and their lifecycle transitions.
///
/// Jobs are kept in insertion order so that the first pending job is always
/// the oldest submission still waiting, on every run and after a restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRegistry {
    jobs: IndexMap<Uuid, Job>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from restored records, preserving their order.
    pub fn from_jobs(jobs: IndexMap<Uuid, Job>) -> Self {
        Self { jobs }
    }

    pub fn jobs(&self) -> &IndexMap<Uuid, Job> {
        &self.jobs
    }

    /// Validate the request and add a fresh pending job.
    pub fn create(&mut self, request: JobRequest) -> Result<Uuid> {
        request.validate()?;
        let job = Job::new(request);
        let id = job.id;
        self.jobs.insert(id, job);
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> Result<&Job> {
        self.jobs.get(id).ok_or(DispatchError::JobNotFound(*id))
    }

    fn get_mut(&mut self, id: &Uuid) -> Result<&mut Job> {
        self.jobs.get_mut(id).ok_or(DispatchError::JobNotFound(*id))
    }

    /// All jobs in submission order.
    pub fn list(&self) -> Vec<&Job> {
        self.jobs.values().collect()
    }

    /// The oldest job still waiting for an engine.
    pub fn first_pending(&self) -> Option<&Job> {
        self.jobs.values().find(|j| j.status == JobStatus::Pending)
    }

    pub fn pending_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .count()
    }

    /// Jobs that have been assigned since before `cutoff`.
    pub fn assigned_before(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Assigned)
            .filter(|j| j.assigned_at.is_some_and(|at| at < cutoff))
            .map(|j| j.id)
            .collect()
    }

    /// Jobs last held by `engine_id`, in submission order. Includes finished
    /// and requeued jobs.
    pub fn jobs_for_engine(&self, engine_id: &str) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|j| j.last_engine.as_deref() == Some(engine_id))
            .collect()
    }

    pub fn status_counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Assigned => counts.assigned += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::FailedPermanently => counts.failed_permanently += 1,
            }
        }
        counts
    }

    /// pending -> assigned
    pub fn mark_assigned(&mut self, id: &Uuid, engine_id: &str) -> Result<()> {
        let job = self.get_mut(id)?;
        if job.status != JobStatus::Pending {
            return Err(DispatchError::invalid_job_state(
                *id,
                JobStatus::Pending,
                job.status,
            ));
        }
        let now = Utc::now();
        job.status = JobStatus::Assigned;
        job.assigned_engine = Some(engine_id.to_string());
        job.last_engine = Some(engine_id.to_string());
        job.assigned_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    /// assigned -> completed
    pub fn mark_completed(&mut self, id: &Uuid, output_url: &str) -> Result<()> {
        let job = self.get_mut(id)?;
        if output_url.trim().is_empty() {
            return Err(DispatchError::InvalidInput(
                "output_url must not be empty".to_string(),
            ));
        }
        if job.status != JobStatus::Assigned {
            return Err(DispatchError::invalid_job_state(
                *id,
                JobStatus::Assigned,
                job.status,
            ));
        }
        job.status = JobStatus::Completed;
        job.assigned_engine = None;
        job.assigned_at = None;
        job.output_url = Some(output_url.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Route a failure report through the retry policy.
    pub fn mark_failed(
        &mut self,
        id: &Uuid,
        error_message: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome> {
        let job = self.get_mut(id)?;
        policy.apply(job, error_message, Utc::now())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(size: f64) -> JobRequest {
        JobRequest::new("http://media/in.mp4", "av1", size, 3)
    }

    #[test]
    fn create_and_get() {
        let mut jobs = JobRegistry::new();
        let id = jobs.create(request(12.0)).unwrap();

        let job = jobs.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retries, 0);
        assert!(job.assigned_engine.is_none());
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn create_rejects_invalid_request() {
        let mut jobs = JobRegistry::new();
        assert!(jobs.create(request(-5.0)).is_err());
        assert!(jobs.is_empty());
    }

    #[test]
    fn get_unknown_is_not_found() {
        let jobs = JobRegistry::new();
        let err = jobs.get(&Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DispatchError::JobNotFound(_)));
    }

    #[test]
    fn list_keeps_insertion_order() {
        let mut jobs = JobRegistry::new();
        let ids: Vec<Uuid> = (0..5)
            .map(|i| jobs.create(request(i as f64)).unwrap())
            .collect();

        let listed: Vec<Uuid> = jobs.list().iter().map(|j| j.id).collect();
        assert_eq!(listed, ids);
        assert_eq!(jobs.first_pending().map(|j| j.id), Some(ids[0]));
    }

    #[test]
    fn assign_requires_pending() {
        let mut jobs = JobRegistry::new();
        let id = jobs.create(request(1.0)).unwrap();

        jobs.mark_assigned(&id, "e1").unwrap();
        let job = jobs.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Assigned);
        assert_eq!(job.assigned_engine.as_deref(), Some("e1"));

        let err = jobs.mark_assigned(&id, "e2").unwrap_err();
        assert!(matches!(err, DispatchError::InvalidState { .. }));
    }

    #[test]
    fn complete_requires_assigned() {
        let mut jobs = JobRegistry::new();
        let id = jobs.create(request(1.0)).unwrap();

        let err = jobs.mark_completed(&id, "s3://out/a.mp4").unwrap_err();
        assert!(matches!(err, DispatchError::InvalidState { .. }));

        jobs.mark_assigned(&id, "e1").unwrap();
        jobs.mark_completed(&id, "s3://out/a.mp4").unwrap();

        let job = jobs.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output_url.as_deref(), Some("s3://out/a.mp4"));
        assert!(job.assigned_engine.is_none());
        assert!(job.check_invariants().is_ok());

        // Terminal: a second completion is rejected and changes nothing.
        let before = job.clone();
        assert!(jobs.mark_completed(&id, "s3://out/b.mp4").is_err());
        assert_eq!(jobs.get(&id).unwrap(), &before);
    }

    #[test]
    fn complete_unknown_job_with_empty_url_is_not_found() {
        let mut jobs = JobRegistry::new();
        let err = jobs.mark_completed(&Uuid::new_v4(), "").unwrap_err();
        assert!(matches!(err, DispatchError::JobNotFound(_)));

        let id = jobs.create(request(1.0)).unwrap();
        jobs.mark_assigned(&id, "e1").unwrap();
        let err = jobs.mark_completed(&id, " ").unwrap_err();
        assert!(matches!(err, DispatchError::InvalidInput(_)));
    }

    #[test]
    fn jobs_for_engine_keeps_history() {
        let mut jobs = JobRegistry::new();
        let done = jobs.create(request(1.0)).unwrap();
        let running = jobs.create(request(2.0)).unwrap();
        let elsewhere = jobs.create(request(3.0)).unwrap();
        jobs.create(request(4.0)).unwrap();

        jobs.mark_assigned(&done, "e1").unwrap();
        jobs.mark_completed(&done, "s3://out/done.mp4").unwrap();
        jobs.mark_assigned(&running, "e1").unwrap();
        jobs.mark_assigned(&elsewhere, "e2").unwrap();

        let ids: Vec<Uuid> = jobs.jobs_for_engine("e1").iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![done, running]);
        assert!(jobs.jobs_for_engine("e3").is_empty());

        assert_eq!(
            jobs.status_counts(),
            JobCounts {
                pending: 1,
                assigned: 2,
                completed: 1,
                failed_permanently: 0,
            }
        );
    }

    #[test]
    fn mark_failed_unknown_is_not_found() {
        let mut jobs = JobRegistry::new();
        let err = jobs
            .mark_failed(&Uuid::new_v4(), "oops", &RetryPolicy::new())
            .unwrap_err();
        assert!(matches!(err, DispatchError::JobNotFound(_)));
    }

    #[test]
    fn assigned_before_filters_by_time() {
        let mut jobs = JobRegistry::new();
        let id = jobs.create(request(1.0)).unwrap();
        jobs.create(request(2.0)).unwrap();
        jobs.mark_assigned(&id, "e1").unwrap();

        let future = Utc::now() + chrono::Duration::seconds(60);
        let past = Utc::now() - chrono::Duration::seconds(60);
        assert_eq!(jobs.assigned_before(future), vec![id]);
        assert!(jobs.assigned_before(past).is_empty());
    }
}
