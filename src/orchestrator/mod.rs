//! Turns an inbound message into a model decision, runs it, and publishes
//! the reply.

pub mod decision;
pub mod handler;
pub mod prompts;

use std::time::Duration;

use switchyard_protocol::ProtocolError;
use thiserror::Error;

use crate::bus::BusError;
use crate::jobs::JobError;
use crate::llm::LlmError;

pub use decision::{Action, Decision, parse_decision};
pub use handler::{OrchestrationResponse, Orchestrator};
pub use prompts::Prompts;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    InvalidMessage(#[from] ProtocolError),
    #[error("decision is missing `{0}`")]
    MissingField(&'static str),
    #[error("could not render prompt: {0}")]
    Prompt(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Hard cap on waiting for an instant job.
    pub instant_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            instant_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}
