use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use switchyard_protocol::HealthStatus;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{ExecutionType, Job, JobError, JobSpec, JobStatus, QueueStats};
use crate::function::{ExecutionContext, FunctionRegistry, RegistryError};
use crate::logger::Metrics;

/// Hours a repeat job runs for when no deadline is given.
const DEFAULT_REPEAT_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_concurrent_jobs: usize,
    /// Terminal jobs kept for lookup; older ones are evicted first.
    pub retention: usize,
    /// Delay before the second attempt; doubles for each one after.
    pub backoff_base: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            retention: 1000,
            backoff_base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    job_id: String,
}

impl Ord for ReadyEntry {
    // Max-heap: higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Ticket {
    job_id: String,
    function_name: String,
    parameters: Value,
    attempt: u32,
    max_attempts: u32,
    correlation_id: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
}

/// What to do once a run has been recorded, decided while the record was
/// locked and carried out after the lock is released.
enum FollowUp {
    Nothing,
    Terminal { function: String, ok: bool },
    Rearm { at: DateTime<Utc> },
}

struct Inner {
    registry: Arc<FunctionRegistry>,
    config: EngineConfig,
    jobs: DashMap<String, Job>,
    ready: Mutex<BinaryHeap<ReadyEntry>>,
    ready_signal: Notify,
    timers: DashMap<String, (u64, CancellationToken)>,
    retained: Mutex<VecDeque<String>>,
    terminal_signal: Notify,
    permits: Arc<Semaphore>,
    paused: AtomicBool,
    shutdown: CancellationToken,
    seq: AtomicU64,
    metrics: Metrics,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Accepts job specs, tracks each job through
/// `Pending -> Running -> Completed | Failed` (or `Cancelled`), and runs
/// them on at most `max_concurrent_jobs` workers.
#[derive(Clone)]
pub struct JobEngine {
    inner: Arc<Inner>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl JobEngine {
    /// Must be called inside a Tokio runtime; spawns the dispatcher.
    pub fn new(registry: Arc<FunctionRegistry>, config: EngineConfig) -> Self {
        let workers = config.max_concurrent_jobs.max(1);
        let inner = Arc::new(Inner {
            registry,
            permits: Arc::new(Semaphore::new(workers)),
            config,
            jobs: DashMap::new(),
            ready: Mutex::new(BinaryHeap::new()),
            ready_signal: Notify::new(),
            timers: DashMap::new(),
            retained: Mutex::new(VecDeque::new()),
            terminal_signal: Notify::new(),
            paused: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            seq: AtomicU64::new(0),
            metrics: Metrics::new(),
        });
        let handle = tokio::spawn(dispatch_loop(inner.clone()));
        Self {
            inner,
            dispatcher: Arc::new(Mutex::new(Some(handle))),
        }
    }

    #[tracing::instrument(name = "job_add", skip(self, spec), fields(function = %spec.function_name, mode = ?spec.execution_type))]
    pub fn add_job(&self, mut spec: JobSpec) -> Result<String, JobError> {
        let inner = &self.inner;
        let function = inner
            .registry
            .lookup(&spec.function_name)
            .ok_or_else(|| JobError::FunctionNotFound(spec.function_name.clone()))?;
        if inner.shutdown.is_cancelled() {
            return Err(JobError::ShuttingDown);
        }

        let now = Utc::now();
        let next_run_at = match spec.execution_type {
            ExecutionType::Instant => None,
            ExecutionType::Schedule => {
                let at = spec
                    .schedule_time
                    .ok_or_else(|| JobError::InvalidSchedule("scheduleTime is required".into()))?;
                if at <= now {
                    return Err(JobError::InvalidSchedule(format!(
                        "scheduleTime {} is not in the future",
                        at.to_rfc3339()
                    )));
                }
                Some(at)
            }
            ExecutionType::Repeat => {
                let kind = function.definition.kind;
                if !kind.can_repeat() {
                    return Err(JobError::NotRepeatable {
                        function: spec.function_name.clone(),
                        kind,
                    });
                }
                let interval = spec.repeat_interval.filter(|ms| *ms > 0).ok_or_else(|| {
                    JobError::InvalidSchedule(
                        "repeatInterval must be a positive number of milliseconds".into(),
                    )
                })?;
                let deadline = spec
                    .repeat_deadline
                    .unwrap_or(now + chrono::Duration::hours(DEFAULT_REPEAT_WINDOW_HOURS));
                if deadline <= now {
                    return Err(JobError::InvalidSchedule(format!(
                        "repeatDeadline {} is not in the future",
                        deadline.to_rfc3339()
                    )));
                }
                let first = millis(interval)
                    .and_then(|step| now.checked_add_signed(step))
                    .ok_or_else(|| JobError::InvalidSchedule("repeatInterval out of range".into()))?;
                if first > deadline {
                    return Err(JobError::InvalidSchedule(format!(
                        "repeatInterval of {interval} ms does not fit before repeatDeadline {}",
                        deadline.to_rfc3339()
                    )));
                }
                spec.repeat_deadline = Some(deadline);
                Some(first)
            }
        };

        let id = Uuid::new_v4().to_string();
        let mode = spec.execution_type;
        inner.jobs.insert(id.clone(), Job::new(id.clone(), spec, next_run_at));
        info!(target: "job", job_id = %id, ?mode, "job accepted");

        match next_run_at {
            None => inner.enqueue_ready(&id),
            Some(at) => inner.arm_timer(&id, at),
        }
        Ok(id)
    }

    /// Marks a pending or running job cancelled and drops its queue entry
    /// and timer. A running handler is not interrupted; its result is
    /// ignored.
    #[tracing::instrument(name = "job_cancel", skip(self))]
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let inner = &self.inner;
        let function = {
            let Some(mut job) = inner.jobs.get_mut(job_id) else {
                return false;
            };
            if job.status.is_terminal() {
                return false;
            }
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            job.next_run_at = None;
            job.data.function_name.clone()
        };

        if let Some((_, (_, token))) = inner.timers.remove(job_id) {
            token.cancel();
        }
        lock(&inner.ready).retain(|entry| entry.job_id != job_id);
        info!(target: "job", job_id, function = %function, "job cancelled");
        inner.retire(job_id);
        true
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.inner.jobs.get(job_id).map(|j| j.clone())
    }

    /// Newest first.
    pub fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .jobs
            .iter()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    pub fn queue_stats(&self) -> QueueStats {
        let paused = self.inner.paused.load(AtomicOrdering::SeqCst);
        let mut stats = QueueStats::default();
        for job in self.inner.jobs.iter() {
            match job.status {
                JobStatus::Pending if job.next_run_at.is_some() => stats.delayed += 1,
                JobStatus::Pending if paused => stats.paused += 1,
                JobStatus::Pending => stats.waiting += 1,
                JobStatus::Running => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Stops pickup of waiting jobs; running ones finish normally.
    pub fn pause(&self) {
        self.inner.paused.store(true, AtomicOrdering::SeqCst);
        info!("job queue paused");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, AtomicOrdering::SeqCst);
        self.inner.ready_signal.notify_one();
        info!("job queue resumed");
    }

    /// Waits for `job_id` to reach a terminal state. Status is re-checked
    /// every `poll_interval` and on every terminal transition; `timeout` is
    /// a hard wall-clock limit.
    pub async fn wait_for_completion(
        &self,
        job_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Job, JobError> {
        let wait = async {
            loop {
                let notified = self.inner.terminal_signal.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.get_job(job_id) {
                    None => return Err(JobError::JobNotFound(job_id.to_string())),
                    Some(job) if job.status.is_terminal() => return Ok(job),
                    Some(_) => {}
                }
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| JobError::WaitTimeout {
                job_id: job_id.to_string(),
                waited_ms: timeout.as_millis() as u64,
            })?
    }

    /// Cancels every schedule, repeat and retry timer, stops pickup, then
    /// waits up to `timeout` for running handlers to finish.
    pub async fn shutdown(&self, timeout: Duration) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let timers = inner.timers.len();
        inner.timers.clear();
        info!(timers, "job engine shutting down");

        let workers = inner.config.max_concurrent_jobs.max(1) as u32;
        match tokio::time::timeout(timeout, inner.permits.acquire_many(workers)).await {
            Ok(_) => info!("all running jobs drained"),
            Err(_) => warn!(
                still_running = self.queue_stats().active,
                "shutdown timeout elapsed with jobs still running"
            ),
        }
        inner.permits.close();

        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
    }

    pub fn health(&self) -> HealthStatus {
        if self.inner.shutdown.is_cancelled() {
            return HealthStatus::unhealthy("job_engine", "shut down");
        }
        let s = self.queue_stats();
        HealthStatus::healthy(
            "job_engine",
            format!(
                "{} waiting, {} active, {} delayed, {} completed, {} failed",
                s.waiting, s.active, s.delayed, s.completed, s.failed
            ),
        )
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    loop {
        let permit = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            permit = inner.permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let job_id = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            id = inner.next_ready() => id,
        };
        if let Some(ticket) = inner.claim(&job_id) {
            tokio::spawn(inner.clone().run(ticket, permit));
        }
    }
    debug!("job dispatcher stopped");
}

impl Inner {
    async fn next_ready(&self) -> String {
        loop {
            if !self.paused.load(AtomicOrdering::SeqCst) {
                if let Some(entry) = lock(&self.ready).pop() {
                    return entry.job_id;
                }
            }
            self.ready_signal.notified().await;
        }
    }

    fn enqueue_ready(&self, job_id: &str) {
        let priority = {
            let Some(mut job) = self.jobs.get_mut(job_id) else {
                return;
            };
            if job.status != JobStatus::Pending {
                return;
            }
            job.next_run_at = None;
            job.data.priority.unwrap_or(0)
        };
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        lock(&self.ready).push(ReadyEntry {
            priority,
            seq,
            job_id: job_id.to_string(),
        });
        self.ready_signal.notify_one();
    }

    /// Moves a ready job to `Running`. Stale queue entries (cancelled or
    /// already claimed) yield `None`.
    fn claim(&self, job_id: &str) -> Option<Ticket> {
        let mut job = self.jobs.get_mut(job_id)?;
        if job.status != JobStatus::Pending {
            return None;
        }
        let max_attempts = match job.data.retries {
            Some(r) => r.max(1),
            None => self
                .registry
                .lookup(&job.data.function_name)
                .map(|f| f.definition.max_attempts())
                .unwrap_or(1),
        };
        job.status = JobStatus::Running;
        job.started_at.get_or_insert_with(Utc::now);
        job.attempts_made += 1;
        job.next_run_at = None;
        Some(Ticket {
            job_id: job.id.clone(),
            function_name: job.data.function_name.clone(),
            parameters: Value::Object(job.data.parameters.clone()),
            attempt: job.attempts_made,
            max_attempts,
            correlation_id: job.data.correlation_id.clone(),
            user_id: job.data.user_id.clone(),
            session_id: job.data.session_id.clone(),
        })
    }

    async fn run(self: Arc<Self>, ticket: Ticket, permit: OwnedSemaphorePermit) {
        let started = Instant::now();
        let weak: Weak<Inner> = Arc::downgrade(&self);
        let progress_id = ticket.job_id.clone();
        let mut ctx = ExecutionContext::for_job(&ticket.job_id, ticket.attempt)
            .with_user(ticket.user_id.clone(), ticket.session_id.clone());
        if let Some(correlation_id) = &ticket.correlation_id {
            ctx = ctx.with_correlation(correlation_id.clone());
        }
        let ctx = ctx.with_progress(move |pct| {
            if let Some(inner) = weak.upgrade() {
                if let Some(mut job) = inner.jobs.get_mut(&progress_id) {
                    if job.status == JobStatus::Running {
                        job.progress = Some(pct);
                    }
                }
            }
        });

        debug!(job_id = %ticket.job_id, attempt = ticket.attempt, "job picked up");
        let outcome = self
            .registry
            .invoke(&ticket.function_name, &ticket.parameters, ctx)
            .await;
        drop(permit);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        match self.settle(&ticket, outcome) {
            FollowUp::Nothing => {}
            FollowUp::Terminal { function, ok } => {
                self.metrics.record_job(&function, ok, elapsed_ms);
                self.retire(&ticket.job_id);
            }
            FollowUp::Rearm { at } => self.arm_timer(&ticket.job_id, at),
        }
    }

    fn settle(&self, ticket: &Ticket, outcome: Result<Value, RegistryError>) -> FollowUp {
        let Some(mut job) = self.jobs.get_mut(&ticket.job_id) else {
            return FollowUp::Nothing;
        };
        if job.status != JobStatus::Running {
            debug!(job_id = %job.id, status = ?job.status, "discarding result of job that is no longer running");
            return FollowUp::Nothing;
        }
        let now = Utc::now();
        let repeat = job.data.execution_type == ExecutionType::Repeat;

        match outcome {
            Err(err) if !err.is_permanent() && ticket.attempt < ticket.max_attempts => {
                let delay = self.backoff(ticket.attempt);
                warn!(
                    target: "job",
                    job_id = %job.id,
                    attempt = ticket.attempt,
                    max_attempts = ticket.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "job attempt failed; retrying"
                );
                let at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(now);
                job.status = JobStatus::Pending;
                job.error = Some(err.to_string());
                job.next_run_at = Some(at);
                FollowUp::Rearm { at }
            }
            outcome if repeat => {
                match outcome {
                    Ok(value) => {
                        job.result = Some(value);
                        job.error = None;
                    }
                    Err(err) => {
                        warn!(target: "job", job_id = %job.id, error = %err, "repeat run failed");
                        job.error = Some(err.to_string());
                    }
                }
                job.runs += 1;
                job.attempts_made = 0;
                let next = job
                    .data
                    .repeat_interval
                    .and_then(millis)
                    .and_then(|step| now.checked_add_signed(step));
                match (next, job.data.repeat_deadline) {
                    (Some(next), Some(deadline)) if next <= deadline => {
                        job.status = JobStatus::Pending;
                        job.next_run_at = Some(next);
                        FollowUp::Rearm { at: next }
                    }
                    _ => {
                        info!(target: "job", job_id = %job.id, runs = job.runs, "repeat schedule reached its deadline");
                        job.status = JobStatus::Completed;
                        job.completed_at = Some(now);
                        FollowUp::Terminal {
                            function: job.data.function_name.clone(),
                            ok: job.error.is_none(),
                        }
                    }
                }
            }
            Ok(value) => {
                info!(target: "job", job_id = %job.id, attempt = ticket.attempt, "job completed");
                job.status = JobStatus::Completed;
                job.result = Some(value);
                job.error = None;
                job.progress = Some(100);
                job.completed_at = Some(now);
                FollowUp::Terminal {
                    function: job.data.function_name.clone(),
                    ok: true,
                }
            }
            Err(err) => {
                warn!(target: "job", job_id = %job.id, attempt = ticket.attempt, error = %err, "job failed");
                job.status = JobStatus::Failed;
                job.error = Some(err.to_string());
                job.completed_at = Some(now);
                FollowUp::Terminal {
                    function: job.data.function_name.clone(),
                    ok: false,
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.config.backoff_base.saturating_mul(1u32 << exp)
    }

    /// Re-enqueues `job_id` at `at` unless the timer is cancelled first.
    /// Re-arming replaces any previous timer for the job.
    fn arm_timer(self: &Arc<Self>, job_id: &str, at: DateTime<Utc>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let generation = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        let token = self.shutdown.child_token();
        if let Some((_, old)) = self.timers.insert(job_id.to_string(), (generation, token.clone())) {
            old.cancel();
        }

        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let inner = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    inner.timers.remove_if(&job_id, |_, (g, _)| *g == generation);
                    inner.enqueue_ready(&job_id);
                }
            }
        });
    }

    /// Records a terminal job for retention and wakes waiters.
    fn retire(&self, job_id: &str) {
        let evicted: Vec<String> = {
            let mut retained = lock(&self.retained);
            retained.push_back(job_id.to_string());
            let mut evicted = Vec::new();
            while retained.len() > self.config.retention {
                if let Some(old) = retained.pop_front() {
                    evicted.push(old);
                }
            }
            evicted
        };
        for old in evicted {
            self.jobs.remove(&old);
            debug!(job_id = %old, "evicted retained job");
        }
        self.terminal_signal.notify_waiters();
    }
}

/// `None` when `ms` does not fit a `TimeDelta`.
fn millis(ms: u64) -> Option<chrono::Duration> {
    chrono::Duration::try_milliseconds(i64::try_from(ms).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{FunctionDefinition, FunctionKind, ParamSpec, ParamType, handler_fn};
    use serde_json::{Map, json};
    use std::sync::atomic::AtomicUsize;

    fn registry() -> Arc<FunctionRegistry> {
        let registry = FunctionRegistry::new();
        registry
            .register(
                FunctionDefinition::new("add", "adds a and b", FunctionKind::Helper)
                    .param(ParamSpec::required("a", ParamType::Number, ""))
                    .param(ParamSpec::required("b", ParamType::Number, "")),
                handler_fn(|p, _c| async move {
                    let a = p["a"].as_f64().unwrap_or(0.0);
                    let b = p["b"].as_f64().unwrap_or(0.0);
                    Ok::<_, anyhow::Error>(json!(a + b))
                }),
            )
            .unwrap();
        registry
            .register(
                FunctionDefinition::new("tick", "repeatable", FunctionKind::Runner),
                handler_fn(|_p, c| async move { Ok::<_, anyhow::Error>(json!(c.job_id)) }),
            )
            .unwrap();
        registry
    }

    fn params(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    fn engine_with(registry: Arc<FunctionRegistry>, config: EngineConfig) -> JobEngine {
        JobEngine::new(registry, config)
    }

    fn fast() -> EngineConfig {
        EngineConfig {
            backoff_base: Duration::from_millis(10),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn instant_job_completes_and_stays_terminal() {
        let engine = engine_with(registry(), fast());
        let id = engine
            .add_job(JobSpec::instant("add", params(json!({"a": 2, "b": 3}))))
            .unwrap();
        let job = engine
            .wait_for_completion(&id, Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!(5.0)));
        assert_eq!(job.attempts_made, 1);
        assert!(job.started_at.is_some() && job.completed_at.is_some());

        assert!(!engine.cancel_job(&id));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.get_job(&id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn handler_sees_the_requesting_message() {
        let registry = FunctionRegistry::new();
        registry
            .register(
                FunctionDefinition::new("whoami", "echoes its origin", FunctionKind::Helper),
                handler_fn(|_p, c| async move {
                    Ok::<_, anyhow::Error>(json!([c.correlation_id, c.user_id, c.session_id]))
                }),
            )
            .unwrap();
        let engine = engine_with(registry, fast());

        let mut spec = JobSpec::instant("whoami", Map::new());
        spec.correlation_id = Some("msg-7".into());
        spec.user_id = Some("u1".into());
        let id = engine.add_job(spec).unwrap();
        let job = engine
            .wait_for_completion(&id, Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(job.result, Some(json!(["msg-7", "u1", null])));
    }

    #[tokio::test]
    async fn unknown_function_and_invalid_schedules() {
        let engine = engine_with(registry(), fast());
        assert_eq!(
            engine.add_job(JobSpec::instant("nope", Map::new())).unwrap_err(),
            JobError::FunctionNotFound("nope".into())
        );

        let past = Utc::now() - chrono::Duration::seconds(1);
        assert!(matches!(
            engine.add_job(JobSpec::scheduled("add", Map::new(), past)),
            Err(JobError::InvalidSchedule(_))
        ));

        let mut no_time = JobSpec::instant("add", Map::new());
        no_time.execution_type = ExecutionType::Schedule;
        assert!(matches!(engine.add_job(no_time), Err(JobError::InvalidSchedule(_))));

        assert!(matches!(
            engine.add_job(JobSpec::repeating("tick", Map::new(), 0, None)),
            Err(JobError::InvalidSchedule(_))
        ));
        assert!(engine.list_jobs(None, 100).is_empty());
    }

    #[tokio::test]
    async fn repeat_requires_runner_and_creates_nothing_otherwise() {
        let engine = engine_with(registry(), fast());
        let err = engine
            .add_job(JobSpec::repeating("add", Map::new(), 1000, None))
            .unwrap_err();
        assert_eq!(
            err,
            JobError::NotRepeatable {
                function: "add".into(),
                kind: FunctionKind::Helper
            }
        );
        assert!(engine.list_jobs(None, 100).is_empty());

        let id = engine
            .add_job(JobSpec::repeating("tick", Map::new(), 60_000, None))
            .unwrap();
        let job = engine.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        let deadline = job.data.repeat_deadline.unwrap();
        let window = deadline - job.created_at;
        assert!(window > chrono::Duration::hours(23) && window <= chrono::Duration::hours(24));
        assert_eq!(engine.queue_stats().delayed, 1);
    }

    #[tokio::test]
    async fn repeat_interval_must_fit_the_window() {
        let engine = engine_with(registry(), fast());

        let huge = engine
            .add_job(JobSpec::repeating("tick", Map::new(), 10_000_000_000_000_000, None))
            .unwrap_err();
        assert_eq!(huge, JobError::InvalidSchedule("repeatInterval out of range".into()));
        assert!(matches!(
            engine.add_job(JobSpec::repeating("tick", Map::new(), u64::MAX, None)),
            Err(JobError::InvalidSchedule(_))
        ));

        let soon = Utc::now() + chrono::Duration::seconds(1);
        let err = engine
            .add_job(JobSpec::repeating("tick", Map::new(), 3_600_000, Some(soon)))
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidSchedule(ref m) if m.contains("does not fit")), "{err}");
        assert!(engine.list_jobs(None, 100).is_empty());
    }

    #[tokio::test]
    async fn repeat_runs_until_deadline() {
        let engine = engine_with(registry(), fast());
        let deadline = Utc::now() + chrono::Duration::milliseconds(350);
        let id = engine
            .add_job(JobSpec::repeating("tick", Map::new(), 100, Some(deadline)))
            .unwrap();
        let job = engine
            .wait_for_completion(&id, Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.runs >= 2, "ran {} times", job.runs);
        assert_eq!(job.result, Some(json!(id)));
    }

    #[tokio::test]
    async fn scheduled_job_waits_then_runs() {
        let engine = engine_with(registry(), fast());
        let at = Utc::now() + chrono::Duration::milliseconds(150);
        let id = engine
            .add_job(JobSpec::scheduled("add", params(json!({"a": 1, "b": 1})), at))
            .unwrap();
        assert_eq!(engine.queue_stats().delayed, 1);
        let job = engine
            .wait_for_completion(&id, Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.started_at.unwrap() >= at - chrono::Duration::milliseconds(20));
    }

    #[tokio::test]
    async fn cancel_pending_scheduled_job_stops_timer() {
        let engine = engine_with(registry(), fast());
        let at = Utc::now() + chrono::Duration::milliseconds(100);
        let id = engine
            .add_job(JobSpec::scheduled("add", params(json!({"a": 1, "b": 1})), at))
            .unwrap();
        assert!(engine.cancel_job(&id));
        assert!(!engine.cancel_job(&id));
        assert!(!engine.cancel_job("never-issued"));

        tokio::time::sleep(Duration::from_millis(250)).await;
        let job = engine.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert_eq!(engine.queue_stats().cancelled, 1);
    }

    #[tokio::test]
    async fn failures_retry_with_backoff_then_fail() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry
            .register(
                FunctionDefinition::new("flaky", "always fails", FunctionKind::Worker).with_retries(3),
                handler_fn(move |_p, _c| {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                    async { Err::<Value, _>(anyhow::anyhow!("upstream unavailable")) }
                }),
            )
            .unwrap();
        let engine = engine_with(registry, fast());
        let id = engine.add_job(JobSpec::instant("flaky", Map::new())).unwrap();
        let job = engine
            .wait_for_completion(&id, Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
        assert!(job.error.unwrap().contains("upstream unavailable"));

        assert!(!engine.cancel_job(&id));
        assert_eq!(engine.get_job(&id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn validation_failures_are_not_retried() {
        let engine = engine_with(registry(), fast());
        let id = engine
            .add_job(JobSpec::instant("add", params(json!({"a": 1}))))
            .unwrap();
        let job = engine
            .wait_for_completion(&id, Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts_made, 1);
        assert!(job.error.unwrap().contains("missing required parameter `b`"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_more_than_max_concurrent_running() {
        let registry = registry();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        registry
            .register(
                FunctionDefinition::new("slow", "sleeps", FunctionKind::Worker),
                handler_fn(move |_p, _c| {
                    let (r, p) = (r.clone(), p.clone());
                    async move {
                        let now = r.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        p.fetch_max(now, AtomicOrdering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        r.fetch_sub(1, AtomicOrdering::SeqCst);
                        Ok::<_, anyhow::Error>(Value::Null)
                    }
                }),
            )
            .unwrap();
        let engine = engine_with(registry, fast());

        let ids: Vec<String> = (0..11)
            .map(|_| engine.add_job(JobSpec::instant("slow", Map::new())).unwrap())
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = engine.queue_stats();
        assert_eq!(stats.active, 10);
        assert_eq!(stats.waiting, 1);
        assert_eq!(engine.get_job(&ids[10]).unwrap().status, JobStatus::Pending);

        for id in &ids {
            let job = engine
                .wait_for_completion(id, Duration::from_secs(5), Duration::from_millis(20))
                .await
                .unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
        assert_eq!(peak.load(AtomicOrdering::SeqCst), 10);
    }

    #[tokio::test]
    async fn higher_priority_runs_first_and_pause_holds_queue() {
        let registry = registry();
        let order = Arc::new(Mutex::new(Vec::new()));
        let log = order.clone();
        registry
            .register(
                FunctionDefinition::new("record", "records its tag", FunctionKind::Helper)
                    .param(ParamSpec::required("tag", ParamType::String, "")),
                handler_fn(move |p, _c| {
                    let log = log.clone();
                    async move {
                        log.lock().unwrap().push(p["tag"].as_str().unwrap_or_default().to_string());
                        Ok::<_, anyhow::Error>(Value::Null)
                    }
                }),
            )
            .unwrap();
        let engine = engine_with(
            registry,
            EngineConfig {
                max_concurrent_jobs: 1,
                ..fast()
            },
        );

        engine.pause();
        let low = engine
            .add_job(JobSpec::instant("record", params(json!({"tag": "low"}))))
            .unwrap();
        let high = engine
            .add_job(JobSpec::instant("record", params(json!({"tag": "high"}))).with_priority(10))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.queue_stats().paused, 2);
        assert!(order.lock().unwrap().is_empty());

        engine.resume();
        for id in [&low, &high] {
            engine
                .wait_for_completion(id, Duration::from_secs(5), Duration::from_millis(10))
                .await
                .unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["high".to_string(), "low".to_string()]);
    }

    #[tokio::test]
    async fn cancelling_running_job_discards_late_result() {
        let registry = registry();
        registry
            .register(
                FunctionDefinition::new("slow_add", "sleeps then answers", FunctionKind::Worker),
                handler_fn(|_p, _c| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, anyhow::Error>(json!(42))
                }),
            )
            .unwrap();
        let engine = engine_with(registry, fast());
        let id = engine.add_job(JobSpec::instant("slow_add", Map::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.get_job(&id).unwrap().status, JobStatus::Running);

        assert!(engine.cancel_job(&id));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let job = engine.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn retention_evicts_oldest_terminal_jobs() {
        let engine = engine_with(
            registry(),
            EngineConfig {
                retention: 2,
                ..fast()
            },
        );
        let mut ids = Vec::new();
        for i in 0..3 {
            let id = engine
                .add_job(JobSpec::instant("add", params(json!({"a": i, "b": 0}))))
                .unwrap();
            engine
                .wait_for_completion(&id, Duration::from_secs(5), Duration::from_millis(10))
                .await
                .unwrap();
            ids.push(id);
        }
        assert!(engine.get_job(&ids[0]).is_none());
        assert!(engine.get_job(&ids[1]).is_some());
        assert!(engine.get_job(&ids[2]).is_some());
    }

    #[tokio::test]
    async fn wait_times_out_and_shutdown_refuses_new_jobs() {
        let engine = engine_with(registry(), fast());
        let id = engine
            .add_job(JobSpec::repeating("tick", Map::new(), 60_000, None))
            .unwrap();
        let err = engine
            .wait_for_completion(&id, Duration::from_millis(100), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::WaitTimeout { .. }));

        engine.shutdown(Duration::from_millis(200)).await;
        assert!(engine.health().is_unhealthy());
        assert_eq!(
            engine.add_job(JobSpec::instant("add", Map::new())).unwrap_err(),
            JobError::ShuttingDown
        );
    }

    #[tokio::test]
    async fn progress_is_recorded() {
        let registry = registry();
        registry
            .register(
                FunctionDefinition::new("halfway", "reports progress", FunctionKind::Worker),
                handler_fn(|_p, c| async move {
                    c.report_progress(50);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok::<_, anyhow::Error>(Value::Null)
                }),
            )
            .unwrap();
        let engine = engine_with(registry, fast());
        let id = engine.add_job(JobSpec::instant("halfway", Map::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.get_job(&id).unwrap().progress, Some(50));
        let done = engine
            .wait_for_completion(&id, Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(done.progress, Some(100));
    }

    #[test]
    fn ready_queue_orders_by_priority_then_arrival() {
        let mut heap = BinaryHeap::new();
        heap.push(ReadyEntry { priority: 0, seq: 1, job_id: "a".into() });
        heap.push(ReadyEntry { priority: 5, seq: 2, job_id: "b".into() });
        heap.push(ReadyEntry { priority: 0, seq: 0, job_id: "c".into() });
        let order: Vec<String> = std::iter::from_fn(|| heap.pop().map(|e| e.job_id)).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }
}
