pub mod assigner;
pub mod engine;
pub mod job;
pub mod queue;
pub mod retry;

pub use assigner::{AssignmentOutcome, AssignmentScheduler};
pub use engine::{Engine, EngineCounts, EngineRegistry, EngineStatus, Heartbeat};
pub use job::{Job, JobRequest, JobStatus};
pub use queue::{JobCounts, JobRegistry};
pub use retry::{FailureOutcome, RetryPolicy};
