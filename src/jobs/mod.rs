//! Durable-in-process job queue and the bounded worker pool that drains it.

pub mod engine;
pub mod types;

pub use engine::{EngineConfig, JobEngine};
pub use types::{ExecutionType, Job, JobError, JobSpec, JobStatus, QueueStats};
