//! The dispatch core: both registries behind one lock, written through to
//! the state store on every mutation.
//!
//! A mutation runs against a staged copy of the state. The copy is persisted
//! and only then swapped in, so a failed write leaves memory and disk in
//! agreement and the caller sees the error instead of a false success.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::Result;
use crate::scheduler::{
    AssignmentOutcome, AssignmentScheduler, Engine, EngineCounts, EngineRegistry, EngineStatus,
    FailureOutcome, Heartbeat, Job, JobCounts, JobRegistry, JobRequest, RetryPolicy,
};
use crate::store::StateStore;

/// Reason recorded when an assignment outlives the job timeout.
pub const ASSIGNMENT_TIMEOUT_REASON: &str = "assignment timed out";

/// Point-in-time summary of both registries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub jobs_total: usize,
    pub engines_total: usize,
    pub jobs: JobCounts,
    pub engines: EngineCounts,
}

#[derive(Debug, Clone, Default)]
struct DispatchState {
    jobs: JobRegistry,
    engines: EngineRegistry,
}

pub struct Dispatcher {
    state: Mutex<DispatchState>,
    store: StateStore,
    scheduler: AssignmentScheduler,
    retry: RetryPolicy,
    default_max_retries: u32,
    job_timeout: Option<Duration>,
    engine_timeout: Option<Duration>,
    work_available: Notify,
}

impl Dispatcher {
    /// Restore state from the configured store, or start empty if there is
    /// nothing stored yet.
    pub async fn open(config: &DispatchConfig) -> Result<Self> {
        let store = StateStore::new(&config.state_file);
        let state = match store.load().await? {
            Some((jobs, engines)) => DispatchState { jobs, engines },
            None => {
                tracing::info!(path = %store.path().display(), "No saved state, starting empty");
                DispatchState::default()
            }
        };

        Ok(Self {
            state: Mutex::new(state),
            store,
            scheduler: config.scheduler(),
            retry: RetryPolicy::new(),
            default_max_retries: config.default_max_retries,
            job_timeout: config.job_timeout(),
            engine_timeout: config.engine_timeout(),
            work_available: Notify::new(),
        })
    }

    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    /// Signalled whenever new work or a newly eligible engine may allow an
    /// assignment.
    pub fn work_available(&self) -> &Notify {
        &self.work_available
    }

    fn signal_work(&self) {
        self.work_available.notify_one();
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut DispatchState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let value = f(&mut staged)?;
        self.commit(&mut state, staged).await?;
        Ok(value)
    }

    async fn commit(&self, state: &mut DispatchState, staged: DispatchState) -> Result<()> {
        if let Err(e) = self.store.save(&staged.jobs, &staged.engines).await {
            tracing::error!(
                path = %self.store.path().display(),
                error = %e,
                "Failed to persist state, mutation discarded"
            );
            return Err(e);
        }
        *state = staged;
        Ok(())
    }

    pub async fn submit_job(&self, request: JobRequest) -> Result<Uuid> {
        let job_id = self.mutate(|s| s.jobs.create(request)).await?;
        tracing::info!(job_id = %job_id, "Job submitted");
        self.signal_work();
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: &Uuid) -> Result<Job> {
        self.state.lock().await.jobs.get(job_id).cloned()
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.state
            .lock()
            .await
            .jobs
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.jobs.pending_count()
    }

    pub async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        let engine_id = heartbeat.engine_id.clone();
        let status = self
            .mutate(|s| {
                s.engines.upsert_heartbeat(heartbeat)?;
                Ok(s.engines.get(&engine_id)?.status)
            })
            .await?;
        tracing::debug!(engine_id = %engine_id, status = %status, "Heartbeat received");
        if status == EngineStatus::Idle {
            self.signal_work();
        }
        Ok(())
    }

    pub async fn list_engines(&self) -> Vec<Engine> {
        self.state
            .lock()
            .await
            .engines
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Jobs last held by a registered engine, oldest first.
    pub async fn jobs_for_engine(&self, engine_id: &str) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        state.engines.get(engine_id)?;
        Ok(state
            .jobs
            .jobs_for_engine(engine_id)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn stats(&self) -> DispatchStats {
        let state = self.state.lock().await;
        DispatchStats {
            jobs_total: state.jobs.len(),
            engines_total: state.engines.len(),
            jobs: state.jobs.status_counts(),
            engines: state.engines.status_counts(),
        }
    }

    pub async fn report_benchmark(&self, engine_id: &str, benchmark_time: f64) -> Result<()> {
        self.mutate(|s| s.engines.record_benchmark(engine_id, benchmark_time))
            .await?;
        tracing::info!(engine_id, benchmark_time, "Benchmark recorded");
        self.signal_work();
        Ok(())
    }

    /// Mark an assigned job completed and return its engine to the idle pool.
    pub async fn report_completion(&self, job_id: &Uuid, output_url: &str) -> Result<()> {
        self.mutate(|s| {
            let engine_id = s.jobs.get(job_id)?.assigned_engine.clone();
            s.jobs.mark_completed(job_id, output_url)?;
            release_engine(&mut s.engines, engine_id, *job_id);
            Ok(())
        })
        .await?;
        tracing::info!(job_id = %job_id, output_url, "Job completed");
        self.signal_work();
        Ok(())
    }

    /// Apply the retry policy to an assigned job. The engine is freed
    /// whether the job is requeued or fails permanently.
    pub async fn report_failure(
        &self,
        job_id: &Uuid,
        error_message: &str,
    ) -> Result<FailureOutcome> {
        let outcome = self
            .mutate(|s| {
                let engine_id = s.jobs.get(job_id)?.assigned_engine.clone();
                let outcome = s.jobs.mark_failed(job_id, error_message, &self.retry)?;
                release_engine(&mut s.engines, engine_id, *job_id);
                Ok(outcome)
            })
            .await?;
        self.signal_work();
        Ok(outcome)
    }

    /// One assignment pass. No-op outcomes touch neither memory nor disk.
    pub async fn trigger_assignment(&self) -> Result<AssignmentOutcome> {
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let outcome = self
            .scheduler
            .assign_next(&mut staged.jobs, &mut staged.engines)?;

        if outcome.is_assigned() {
            self.commit(&mut state, staged).await?;
        } else {
            tracing::debug!(?outcome, "Assignment pass made no assignment");
        }
        Ok(outcome)
    }

    /// Run assignment passes until one makes no assignment. Returns the
    /// pairs that were bound.
    pub async fn assign_all(&self) -> Result<Vec<(Uuid, String)>> {
        let mut assigned = Vec::new();
        while let AssignmentOutcome::Assigned { job_id, engine_id } =
            self.trigger_assignment().await?
        {
            assigned.push((job_id, engine_id));
        }
        Ok(assigned)
    }

    /// Fail every job that has been assigned for longer than the job timeout.
    pub async fn reclaim_expired_assignments(&self) -> Result<Vec<(Uuid, FailureOutcome)>> {
        let Some(timeout) = self.job_timeout.and_then(|t| chrono::Duration::from_std(t).ok())
        else {
            return Ok(Vec::new());
        };

        let mut state = self.state.lock().await;
        let expired = state.jobs.assigned_before(Utc::now() - timeout);
        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let mut staged = state.clone();
        let mut reclaimed = Vec::with_capacity(expired.len());
        for job_id in expired {
            let engine_id = staged.jobs.get(&job_id)?.assigned_engine.clone();
            tracing::warn!(
                job_id = %job_id,
                engine_id = ?engine_id,
                "Assignment timed out, reclaiming job"
            );
            let outcome = staged
                .jobs
                .mark_failed(&job_id, ASSIGNMENT_TIMEOUT_REASON, &self.retry)?;
            release_engine(&mut staged.engines, engine_id, job_id);
            reclaimed.push((job_id, outcome));
        }

        self.commit(&mut state, staged).await?;
        drop(state);
        self.signal_work();
        Ok(reclaimed)
    }

    /// Ids of engines whose heartbeat is older than the engine timeout.
    pub async fn stale_engines(&self) -> Vec<String> {
        let Some(timeout) = self.engine_timeout else {
            return Vec::new();
        };
        self.state
            .lock()
            .await
            .engines
            .stale(Utc::now(), timeout)
            .into_iter()
            .map(|e| e.id.clone())
            .collect()
    }
}

/// Free the engine that held `job_id`. The binding is a weak reference, so a
/// vanished or rebound engine is logged and left alone.
fn release_engine(engines: &mut EngineRegistry, engine_id: Option<String>, job_id: Uuid) {
    let Some(engine_id) = engine_id else {
        return;
    };

    let bound_elsewhere = match engines.get(&engine_id) {
        Ok(engine) => engine.current_job.is_some_and(|current| current != job_id),
        Err(_) => {
            tracing::warn!(
                engine_id = %engine_id,
                job_id = %job_id,
                "Assigned engine is no longer registered"
            );
            return;
        }
    };

    if bound_elsewhere {
        tracing::warn!(
            engine_id = %engine_id,
            job_id = %job_id,
            "Engine is bound to another job, not releasing"
        );
        return;
    }

    if engines.mark_idle(&engine_id).is_ok() {
        tracing::debug!(engine_id = %engine_id, job_id = %job_id, "Engine released");
    }
}
