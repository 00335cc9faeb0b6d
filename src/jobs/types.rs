use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::function::FunctionKind;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum JobError {
    #[error("function `{0}` is not registered")]
    FunctionNotFound(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("function `{function}` is a {kind:?} and cannot run on a repeat schedule")]
    NotRepeatable { function: String, kind: FunctionKind },
    #[error("job `{0}` not found")]
    JobNotFound(String),
    #[error("job `{job_id}` did not finish within {waited_ms} ms")]
    WaitTimeout { job_id: String, waited_ms: u64 },
    #[error("job engine is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    #[default]
    Instant,
    Schedule,
    Repeat,
}

/// What the orchestrator asks the engine to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub function_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub execution_type: ExecutionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_time: Option<DateTime<Utc>>,
    /// Milliseconds between runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Id of the request that created the job; every run logs under it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl JobSpec {
    pub fn instant(function_name: &str, parameters: Map<String, Value>) -> Self {
        Self {
            function_name: function_name.to_string(),
            parameters,
            execution_type: ExecutionType::Instant,
            schedule_time: None,
            repeat_interval: None,
            repeat_deadline: None,
            priority: None,
            retries: None,
            correlation_id: None,
            user_id: None,
            session_id: None,
        }
    }

    pub fn scheduled(function_name: &str, parameters: Map<String, Value>, at: DateTime<Utc>) -> Self {
        Self {
            execution_type: ExecutionType::Schedule,
            schedule_time: Some(at),
            ..Self::instant(function_name, parameters)
        }
    }

    pub fn repeating(
        function_name: &str,
        parameters: Map<String, Value>,
        interval_ms: u64,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            execution_type: ExecutionType::Repeat,
            repeat_interval: Some(interval_ms),
            repeat_deadline: deadline,
            ..Self::instant(function_name, parameters)
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Engine-owned record of one job. Callers only ever see clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub data: JobSpec,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Attempts made for the current run.
    pub attempts_made: u32,
    pub progress: Option<u8>,
    /// Set while the job waits on a schedule, repeat or retry timer.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Completed firings of a repeat job.
    pub runs: u32,
}

impl Job {
    pub(crate) fn new(id: String, data: JobSpec, next_run_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id,
            data,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            attempts_made: 0,
            progress: None,
            next_run_at,
            runs: 0,
        }
    }
}

/// Observability snapshot, not a correctness contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: usize,
    pub cancelled: usize,
}
