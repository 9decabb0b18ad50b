use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Idle,
    Busy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCounts {
    pub idle: usize,
    pub busy: usize,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineStatus::Idle => write!(f, "idle"),
            EngineStatus::Busy => write!(f, "busy"),
        }
    }
}

/// A liveness/status report sent periodically by an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub engine_id: String,
    pub status: EngineStatus,
    pub storage_capacity: f64,
}

impl Heartbeat {
    pub fn new(engine_id: impl Into<String>, status: EngineStatus, storage_capacity: f64) -> Self {
        Self {
            engine_id: engine_id.into(),
            status,
            storage_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Engine {
    pub id: String,
    pub status: EngineStatus,
    pub storage_capacity: f64,
    pub last_heartbeat: DateTime<Utc>,
    /// Lower is faster. Absent until the engine reports a benchmark.
    pub benchmark_time: Option<f64>,
    /// The job bound to this engine while it is busy.
    pub current_job: Option<Uuid>,
}

impl Engine {
    /// Idle and benchmarked.
    pub fn is_eligible(&self) -> bool {
        self.status == EngineStatus::Idle && self.benchmark_time.is_some()
    }

    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now.signed_duration_since(self.last_heartbeat) < timeout,
            // Out-of-range timeouts never expire.
            Err(_) => true,
        }
    }
}

/// Owns engine records: liveness from heartbeats and capability from
/// benchmark reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineRegistry {
    engines: IndexMap<String, Engine>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_engines(engines: IndexMap<String, Engine>) -> Self {
        Self { engines }
    }

    pub fn engines(&self) -> &IndexMap<String, Engine> {
        &self.engines
    }

    pub fn get(&self, id: &str) -> Result<&Engine> {
        self.engines
            .get(id)
            .ok_or_else(|| DispatchError::EngineNotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Engine> {
        self.engines
            .get_mut(id)
            .ok_or_else(|| DispatchError::EngineNotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<&Engine> {
        self.engines.values().collect()
    }

    pub fn upsert_heartbeat(&mut self, heartbeat: Heartbeat) -> Result<()> {
        self.upsert_heartbeat_at(heartbeat, Utc::now())
    }

    /// Create the engine or refresh its status, capacity and heartbeat time.
    ///
    /// An engine bound to a job stays busy even if it reports idle: only the
    /// completion or failure path releases a binding, which keeps a busy
    /// engine from being handed a second job.
    pub fn upsert_heartbeat_at(&mut self, heartbeat: Heartbeat, now: DateTime<Utc>) -> Result<()> {
        if heartbeat.engine_id.trim().is_empty() {
            return Err(DispatchError::InvalidInput(
                "engine_id must not be empty".to_string(),
            ));
        }
        if !heartbeat.storage_capacity.is_finite() || heartbeat.storage_capacity < 0.0 {
            return Err(DispatchError::InvalidInput(format!(
                "storage_capacity must be a non-negative number, got {}",
                heartbeat.storage_capacity
            )));
        }

        match self.engines.get_mut(&heartbeat.engine_id) {
            Some(engine) => {
                engine.status = match (engine.current_job, heartbeat.status) {
                    (Some(job_id), EngineStatus::Idle) => {
                        tracing::warn!(
                            engine_id = %engine.id,
                            job_id = %job_id,
                            "Engine reported idle while bound to a job, keeping it busy"
                        );
                        EngineStatus::Busy
                    }
                    (_, status) => status,
                };
                engine.storage_capacity = heartbeat.storage_capacity;
                engine.last_heartbeat = now;
            }
            None => {
                tracing::info!(
                    engine_id = %heartbeat.engine_id,
                    status = %heartbeat.status,
                    "Engine registered"
                );
                self.engines.insert(
                    heartbeat.engine_id.clone(),
                    Engine {
                        id: heartbeat.engine_id,
                        status: heartbeat.status,
                        storage_capacity: heartbeat.storage_capacity,
                        last_heartbeat: now,
                        benchmark_time: None,
                        current_job: None,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn record_benchmark(&mut self, id: &str, benchmark_time: f64) -> Result<()> {
        if !benchmark_time.is_finite() || benchmark_time < 0.0 {
            return Err(DispatchError::InvalidInput(format!(
                "benchmark_time must be a non-negative number, got {}",
                benchmark_time
            )));
        }
        let engine = self.get_mut(id)?;
        engine.benchmark_time = Some(benchmark_time);
        Ok(())
    }

    /// Engines that are idle and have a benchmark, in registry order.
    pub fn list_idle_benchmarked(&self) -> Vec<&Engine> {
        self.engines.values().filter(|e| e.is_eligible()).collect()
    }

    /// Engines whose last heartbeat is older than `timeout`.
    pub fn stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<&Engine> {
        self.engines
            .values()
            .filter(|e| !e.is_alive(now, timeout))
            .collect()
    }

    /// idle -> busy, bound to `job_id`
    pub fn mark_busy(&mut self, id: &str, job_id: Uuid) -> Result<()> {
        let engine = self.get_mut(id)?;
        if engine.status != EngineStatus::Idle {
            return Err(DispatchError::invalid_engine_state(
                id,
                EngineStatus::Idle,
                engine.status,
            ));
        }
        engine.status = EngineStatus::Busy;
        engine.current_job = Some(job_id);
        Ok(())
    }

    /// Release the engine's binding and return it to the idle pool.
    pub fn mark_idle(&mut self, id: &str) -> Result<()> {
        let engine = self.get_mut(id)?;
        engine.status = EngineStatus::Idle;
        engine.current_job = None;
        Ok(())
    }

    pub fn status_counts(&self) -> EngineCounts {
        let mut counts = EngineCounts::default();
        for engine in self.engines.values() {
            match engine.status {
                EngineStatus::Idle => counts.idle += 1,
                EngineStatus::Busy => counts.busy += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_counts_split_idle_and_busy() {
        let mut engines = EngineRegistry::new();
        for id in ["e1", "e2", "e3"] {
            engines
                .upsert_heartbeat(Heartbeat::new(id, EngineStatus::Idle, 10.0))
                .unwrap();
        }
        engines.mark_busy("e2", Uuid::new_v4()).unwrap();

        assert_eq!(engines.status_counts(), EngineCounts { idle: 2, busy: 1 });
        assert_eq!(EngineRegistry::new().status_counts(), EngineCounts::default());
    }

    #[test]
    fn heartbeat_creates_then_refreshes() {
        let mut engines = EngineRegistry::new();
        let t0 = Utc::now();
        engines
            .upsert_heartbeat_at(Heartbeat::new("e1", EngineStatus::Idle, 500.0), t0)
            .unwrap();

        let engine = engines.get("e1").unwrap();
        assert_eq!(engine.status, EngineStatus::Idle);
        assert!(engine.benchmark_time.is_none());

        engines.record_benchmark("e1", 2.5).unwrap();
        let t1 = t0 + chrono::Duration::seconds(10);
        engines
            .upsert_heartbeat_at(Heartbeat::new("e1", EngineStatus::Busy, 250.0), t1)
            .unwrap();

        let engine = engines.get("e1").unwrap();
        assert_eq!(engine.status, EngineStatus::Busy);
        assert_eq!(engine.storage_capacity, 250.0);
        assert_eq!(engine.last_heartbeat, t1);
        // Benchmark survives heartbeats.
        assert_eq!(engine.benchmark_time, Some(2.5));
        assert_eq!(engines.len(), 1);
    }

    #[test]
    fn heartbeat_cannot_free_a_bound_engine() {
        let mut engines = EngineRegistry::new();
        engines
            .upsert_heartbeat(Heartbeat::new("e1", EngineStatus::Idle, 10.0))
            .unwrap();
        engines.mark_busy("e1", Uuid::new_v4()).unwrap();

        engines
            .upsert_heartbeat(Heartbeat::new("e1", EngineStatus::Idle, 10.0))
            .unwrap();
        assert_eq!(engines.get("e1").unwrap().status, EngineStatus::Busy);

        engines.mark_idle("e1").unwrap();
        let engine = engines.get("e1").unwrap();
        assert_eq!(engine.status, EngineStatus::Idle);
        assert!(engine.current_job.is_none());
    }

    #[test]
    fn heartbeat_rejects_bad_input() {
        let mut engines = EngineRegistry::new();
        assert!(engines
            .upsert_heartbeat(Heartbeat::new("", EngineStatus::Idle, 10.0))
            .is_err());
        assert!(engines
            .upsert_heartbeat(Heartbeat::new("e1", EngineStatus::Idle, -1.0))
            .is_err());
        assert!(engines.is_empty());
    }

    #[test]
    fn benchmark_unknown_engine_is_not_found() {
        let mut engines = EngineRegistry::new();
        let err = engines.record_benchmark("ghost", 1.0).unwrap_err();
        assert!(matches!(err, DispatchError::EngineNotFound(_)));
        assert!(engines.is_empty());
    }

    #[test]
    fn benchmark_rejects_negative_time() {
        let mut engines = EngineRegistry::new();
        engines
            .upsert_heartbeat(Heartbeat::new("e1", EngineStatus::Idle, 10.0))
            .unwrap();
        assert!(engines.record_benchmark("e1", -0.5).is_err());
        assert!(engines.get("e1").unwrap().benchmark_time.is_none());
    }

    #[test]
    fn eligibility_needs_idle_and_benchmark() {
        let mut engines = EngineRegistry::new();
        for id in ["unbenched", "benched", "busy"] {
            engines
                .upsert_heartbeat(Heartbeat::new(id, EngineStatus::Idle, 10.0))
                .unwrap();
        }
        engines.record_benchmark("benched", 1.0).unwrap();
        engines.record_benchmark("busy", 1.0).unwrap();
        engines.mark_busy("busy", Uuid::new_v4()).unwrap();

        let eligible: Vec<&str> = engines
            .list_idle_benchmarked()
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(eligible, vec!["benched"]);
    }

    #[test]
    fn mark_busy_twice_is_invalid() {
        let mut engines = EngineRegistry::new();
        engines
            .upsert_heartbeat(Heartbeat::new("e1", EngineStatus::Idle, 10.0))
            .unwrap();
        engines.mark_busy("e1", Uuid::new_v4()).unwrap();
        let err = engines.mark_busy("e1", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidState { .. }));
    }

    #[test]
    fn stale_engines_are_reported() {
        let mut engines = EngineRegistry::new();
        let now = Utc::now();
        engines
            .upsert_heartbeat_at(
                Heartbeat::new("old", EngineStatus::Idle, 10.0),
                now - chrono::Duration::minutes(10),
            )
            .unwrap();
        engines
            .upsert_heartbeat_at(Heartbeat::new("fresh", EngineStatus::Idle, 10.0), now)
            .unwrap();

        let stale: Vec<&str> = engines
            .stale(now, Duration::from_secs(300))
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(stale, vec!["old"]);
    }
}
