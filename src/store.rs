//! Durable snapshot of the dispatch state.
//!
//! The whole state is one JSON document with two keyed collections:
//!
//! ```json
//! { "jobs": { "<job id>": { ... } }, "engines": { "<engine id>": { ... } } }
//! ```
//!
//! Every save rewrites the document. The new content goes to a sibling
//! `.tmp` file which is fsynced and then renamed over the target, so a crash
//! mid-write leaves either the old or the new document, never a torn one.
//! The parent directory is fsynced after the rename so the rename itself is
//! durable.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::scheduler::{Engine, EngineRegistry, Job, JobRegistry};

/// Default name of the persisted state document.
pub const DEFAULT_STATE_FILE: &str = "dispatch_server_state.json";

#[derive(Serialize)]
struct SnapshotRef<'a> {
    jobs: &'a IndexMap<Uuid, Job>,
    engines: &'a IndexMap<String, Engine>,
}

#[derive(Deserialize)]
struct SnapshotOwned {
    #[serde(default)]
    jobs: IndexMap<Uuid, Job>,
    #[serde(default)]
    engines: IndexMap<String, Engine>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    /// Serialize both registries and atomically replace the stored document.
    pub async fn save(&self, jobs: &JobRegistry, engines: &EngineRegistry) -> Result<()> {
        let content = serde_json::to_vec_pretty(&SnapshotRef {
            jobs: jobs.jobs(),
            engines: engines.engines(),
        })?;

        let tmp_path = self.temp_path();
        let written = match write_synced(&tmp_path, &content).await {
            Ok(()) => tokio::fs::rename(&tmp_path, &self.path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %tmp_path.display(),
                        error = %cleanup,
                        "Failed to remove temporary state file"
                    );
                }
            }
            return Err(e.into());
        }

        // The new document is already in place; a failed directory sync only
        // weakens durability and must not be reported as a failed save.
        if let Err(e) = sync_parent_dir(&self.path).await {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to sync state directory"
            );
        }

        tracing::trace!(
            path = %self.path.display(),
            jobs = jobs.len(),
            engines = engines.len(),
            "State saved"
        );
        Ok(())
    }

    /// Load both registries. Returns `None` when no document exists yet.
    ///
    /// A document that cannot be parsed, whose keys disagree with the record
    /// ids, or whose jobs break their lifecycle invariants is rejected.
    pub async fn load(&self) -> Result<Option<(JobRegistry, EngineRegistry)>> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: SnapshotOwned = serde_json::from_slice(&content)?;

        for (key, job) in &snapshot.jobs {
            if *key != job.id {
                return Err(DispatchError::InvalidInput(format!(
                    "job stored under {} has id {}",
                    key, job.id
                )));
            }
            job.check_invariants()?;
        }
        for (key, engine) in &snapshot.engines {
            if *key != engine.id {
                return Err(DispatchError::InvalidInput(format!(
                    "engine stored under {} has id {}",
                    key, engine.id
                )));
            }
        }

        tracing::info!(
            path = %self.path.display(),
            jobs = snapshot.jobs.len(),
            engines = snapshot.engines.len(),
            "Loaded state"
        );

        Ok(Some((
            JobRegistry::from_jobs(snapshot.jobs),
            EngineRegistry::from_engines(snapshot.engines),
        )))
    }
}

async fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}

async fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{EngineStatus, Heartbeat, JobRequest};

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);

        let mut jobs = JobRegistry::new();
        jobs.create(JobRequest::new("in.mov", "h264", 5.0, 3)).unwrap();
        let mut engines = EngineRegistry::new();
        engines
            .upsert_heartbeat(Heartbeat::new("e1", EngineStatus::Idle, 1.0))
            .unwrap();

        store.save(&jobs, &engines).await.unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("state.json.tmp").exists());

        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(doc["jobs"].is_object());
        assert!(doc["engines"]["e1"].is_object());
    }

    #[tokio::test]
    async fn failed_save_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        // A non-empty directory in the target's place makes the rename fail.
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();
        let store = StateStore::new(&path);

        let err = store
            .save(&JobRegistry::new(), &EngineRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Persistence(_)));
        assert!(!dir.path().join("state.json.tmp").exists());
        assert!(path.join("keep").exists());
    }

    #[tokio::test]
    async fn parent_dir_sync_handles_bare_file_names() {
        let dir = tempfile::tempdir().unwrap();
        sync_parent_dir(&dir.path().join("state.json")).await.unwrap();
        sync_parent_dir(Path::new("state.json")).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = StateStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, DispatchError::Serialization(_)));
    }

    #[tokio::test]
    async fn mismatched_engine_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let doc = serde_json::json!({
            "jobs": {},
            "engines": {
                "e1": {
                    "id": "e2",
                    "status": "idle",
                    "storage_capacity": 1.0,
                    "last_heartbeat": "2024-01-01T00:00:00Z",
                    "benchmark_time": null,
                    "current_job": null
                }
            }
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let err = StateStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidInput(_)));
    }
}
