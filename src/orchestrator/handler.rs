use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use serde_json::{Value, json};
use switchyard_protocol::{HealthStatus, IncomingMessage, OutgoingMessage, meta};
use tracing::{debug, error, info, warn};

use super::decision::{Action, CLARIFICATION, Decision, parse_decision};
use super::prompts::{Prompts, render_value};
use super::{OrchestratorConfig, OrchestratorError};
use crate::bus::{MessageBus, MessageHandler};
use crate::function::FunctionRegistry;
use crate::jobs::{ExecutionType, JobEngine, JobError, JobSpec, JobStatus};
use crate::llm::LlmGateway;
use crate::logger::Metrics;

/// What was sent back for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationResponse {
    pub message: OutgoingMessage,
    pub job_ids: Vec<String>,
    pub success: bool,
}

struct Reply {
    text: String,
    job_ids: Vec<String>,
    success: bool,
}

impl Reply {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            job_ids: Vec::new(),
            success: true,
        }
    }

    fn failed(text: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(text)
        }
    }

    fn with_job(mut self, job_id: &str) -> Self {
        self.job_ids.push(job_id.to_string());
        self
    }
}

/// Holds a message id in the in-flight set until dropped.
struct InFlight {
    set: Arc<DashSet<String>>,
    id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

pub struct Orchestrator {
    registry: Arc<FunctionRegistry>,
    llm: Arc<LlmGateway>,
    engine: JobEngine,
    bus: Arc<MessageBus>,
    instance_id: String,
    config: OrchestratorConfig,
    prompts: Prompts,
    in_flight: Arc<DashSet<String>>,
    metrics: Metrics,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        llm: Arc<LlmGateway>,
        engine: JobEngine,
        bus: Arc<MessageBus>,
        instance_id: String,
        config: OrchestratorConfig,
    ) -> Result<Arc<Self>, OrchestratorError> {
        Ok(Arc::new(Self {
            registry,
            llm,
            engine,
            bus,
            instance_id,
            config,
            prompts: Prompts::new()?,
            in_flight: Arc::new(DashSet::new()),
            metrics: Metrics::new(),
        }))
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn enter(&self, id: &str) -> Option<InFlight> {
        self.in_flight.insert(id.to_string()).then(|| InFlight {
            set: self.in_flight.clone(),
            id: id.to_string(),
        })
    }

    /// Processes one inbound message and publishes the reply.
    ///
    /// Returns `Ok(None)` for messages that are ignored: invalid, already
    /// a response, or a duplicate of one still in flight. Every other path
    /// publishes exactly one reply; only a failed publish is an error.
    #[tracing::instrument(name = "orchestrator_handle", skip(self, message), fields(id = %message.id))]
    pub async fn handle(&self, message: IncomingMessage) -> Result<Option<OrchestrationResponse>, OrchestratorError> {
        if let Err(err) = message.validate() {
            warn!(error = %err, "ignoring invalid message");
            return Ok(None);
        }
        if message.is_response() {
            debug!("ignoring response message");
            return Ok(None);
        }
        let Some(_in_flight) = self.enter(&message.id) else {
            warn!("message is already being processed; dropping duplicate delivery");
            return Ok(None);
        };

        debug!(
            user = ?message.meta_str(meta::USER_ID),
            session = ?message.meta_str(meta::SESSION_ID),
            "processing request"
        );

        let reply = match self
            .metrics
            .instrument_request("orchestrate", || self.process(&message))
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                error!(error = %err, "request failed");
                Reply::failed(format!(
                    "I'm sorry, something went wrong while handling your request: {err}"
                ))
            }
        };

        let mut outgoing = OutgoingMessage::response_to(&message, reply.text);
        outgoing.set_meta(meta::JOB_IDS, json!(reply.job_ids));
        outgoing.set_meta(meta::SUCCESS, reply.success);
        self.bus.send_message(&outgoing).await?;
        info!(reply = %outgoing.id, success = reply.success, "reply published");

        Ok(Some(OrchestrationResponse {
            message: outgoing,
            job_ids: reply.job_ids,
            success: reply.success,
        }))
    }

    async fn process(&self, message: &IncomingMessage) -> Result<Reply, OrchestratorError> {
        let decision = self.decide(&message.content).await?;
        info!(action = ?decision.action, function = ?decision.function_name, "model decided");
        match decision.action {
            Action::ExecuteFunction => self.execute_function(message, decision).await,
            Action::CancelJob => Ok(self.cancel(decision)),
            Action::GetStatus => Ok(Reply::ok(self.status_summary())),
            Action::DirectResponse => Ok(Reply::ok(
                decision.response_message.unwrap_or_else(|| CLARIFICATION.to_string()),
            )),
        }
    }

    async fn decide(&self, content: &str) -> Result<Decision, OrchestratorError> {
        let system = self.prompts.decision(&self.registry.export(), Utc::now())?;
        let raw = self
            .llm
            .generate_response(&self.instance_id, content, Some(&system))
            .await?;
        Ok(parse_decision(&raw.content))
    }

    async fn execute_function(&self, message: &IncomingMessage, decision: Decision) -> Result<Reply, OrchestratorError> {
        let name = decision
            .function_name
            .clone()
            .ok_or(OrchestratorError::MissingField("function_name"))?;
        if self.registry.lookup(&name).is_none() {
            return Ok(Reply::failed(format!(
                "I can't do that: there is no function named `{name}`."
            )));
        }

        let spec = JobSpec {
            function_name: name.clone(),
            parameters: decision.parameters,
            execution_type: decision.execution_type,
            schedule_time: decision.schedule_time,
            repeat_interval: decision.repeat_interval,
            repeat_deadline: decision.repeat_deadline,
            priority: None,
            retries: None,
            correlation_id: Some(message.id.clone()),
            user_id: message.meta_str(meta::USER_ID).map(str::to_string),
            session_id: message.meta_str(meta::SESSION_ID).map(str::to_string),
        };
        let job_id = match self.engine.add_job(spec) {
            Ok(id) => id,
            Err(err @ (JobError::InvalidSchedule(_) | JobError::NotRepeatable { .. })) => {
                return Ok(Reply::failed(format!("I couldn't set up `{name}`: {err}.")));
            }
            Err(err) => return Err(err.into()),
        };

        match decision.execution_type {
            ExecutionType::Instant => self.await_instant(message, &name, &job_id).await,
            ExecutionType::Schedule => {
                let at = self
                    .engine
                    .get_job(&job_id)
                    .and_then(|j| j.data.schedule_time)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                Ok(Reply::ok(format!("Scheduled `{name}` to run at {at} (job {job_id}).")).with_job(&job_id))
            }
            ExecutionType::Repeat => {
                let job = self.engine.get_job(&job_id);
                let every = decision.repeat_interval.unwrap_or_default();
                let until = job
                    .and_then(|j| j.data.repeat_deadline)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                Ok(Reply::ok(format!(
                    "Started `{name}` every {} until {until} (job {job_id}).",
                    describe_interval(every)
                ))
                .with_job(&job_id))
            }
        }
    }

    async fn await_instant(&self, message: &IncomingMessage, name: &str, job_id: &str) -> Result<Reply, OrchestratorError> {
        let waited = self
            .engine
            .wait_for_completion(job_id, self.config.instant_timeout, self.config.poll_interval)
            .await;

        let job = match waited {
            Ok(job) => job,
            Err(JobError::WaitTimeout { waited_ms, .. }) => {
                warn!(job_id, waited_ms, "instant job did not finish in time");
                return Ok(Reply::failed(format!(
                    "`{name}` is still running after {} seconds, so I stopped waiting. It may finish later; job id {job_id}.",
                    waited_ms / 1000
                ))
                .with_job(job_id));
            }
            Err(err) => return Err(err.into()),
        };

        match job.status {
            JobStatus::Completed => {
                let result = job.result.unwrap_or(Value::Null);
                Ok(Reply::ok(self.summarize(&message.content, name, &result).await).with_job(job_id))
            }
            JobStatus::Cancelled => Ok(Reply::failed(format!("Job {job_id} for `{name}` was cancelled.")).with_job(job_id)),
            _ => {
                let reason = job.error.unwrap_or_else(|| "unknown error".to_string());
                Ok(Reply::failed(format!("`{name}` failed: {reason}")).with_job(job_id))
            }
        }
    }

    /// Phrases a result for the user; degrades to the raw value when the
    /// model can't be reached.
    async fn summarize(&self, request: &str, function: &str, result: &Value) -> String {
        let phrased = async {
            let prompt = self.prompts.summary(request, function, result)?;
            let response = self.llm.generate_response(&self.instance_id, &prompt, None).await?;
            Ok::<_, OrchestratorError>(response.content)
        };
        match phrased.await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => format!("Result: {}", render_value(result)),
            Err(err) => {
                warn!(error = %err, "summary failed; replying with the raw result");
                format!("Result: {}", render_value(result))
            }
        }
    }

    fn cancel(&self, decision: Decision) -> Reply {
        let Some(job_id) = decision.job_id else {
            return Reply::failed("Which job should I cancel? Please include its job id.");
        };
        if self.engine.cancel_job(&job_id) {
            Reply::ok(format!("Job {job_id} has been cancelled.")).with_job(&job_id)
        } else {
            Reply::failed(format!(
                "I couldn't cancel job {job_id}: it does not exist or has already finished."
            ))
        }
    }

    fn status_summary(&self) -> String {
        let stats = self.engine.queue_stats();
        let health = self.health_check();
        let mut lines = Vec::with_capacity(health.len() + 4);
        if let Some(overall) = health.last() {
            lines.push(format!("System status: {}", overall.status));
        }
        lines.push(format!(
            "Jobs: {} waiting, {} active, {} delayed, {} paused, {} completed, {} failed, {} cancelled",
            stats.waiting, stats.active, stats.delayed, stats.paused, stats.completed, stats.failed, stats.cancelled
        ));
        lines.push(format!("Functions: {} registered", self.registry.len()));
        lines.push(format!("LLM instances: {}", self.llm.instance_count()));
        for part in health.iter().filter(|h| h.module != "orchestrator") {
            lines.push(format!("- {}: {} ({})", part.module, part.status, part.details));
        }
        lines.join("\n")
    }

    /// One record per component, followed by the umbrella `orchestrator`
    /// record.
    pub fn health_check(&self) -> Vec<HealthStatus> {
        let mut parts = vec![
            self.registry.health(),
            self.llm.health(),
            self.engine.health(),
            self.bus.health(),
        ];
        let overall = HealthStatus::aggregate("orchestrator", &parts);
        parts.push(overall);
        parts
    }
}

fn describe_interval(ms: u64) -> String {
    match ms {
        ms if ms >= 3_600_000 && ms % 3_600_000 == 0 => format!("{} h", ms / 3_600_000),
        ms if ms >= 60_000 && ms % 60_000 == 0 => format!("{} min", ms / 60_000),
        ms if ms >= 1_000 && ms % 1_000 == 0 => format!("{} s", ms / 1_000),
        ms => format!("{ms} ms"),
    }
}

#[async_trait]
impl MessageHandler for Orchestrator {
    async fn handle(&self, message: IncomingMessage) -> anyhow::Result<()> {
        Orchestrator::handle(self, message).await?;
        Ok(())
    }
}
