//! Message gateway: consumes requests from a durable broker queue and
//! publishes replies.

pub mod broker;
pub mod gateway;
pub mod memory;
pub mod nats;

use std::time::Duration;

use serde::Serialize;
use switchyard_protocol::ProtocolError;
use thiserror::Error;

pub use broker::{Acker, Broker, Delivery};
pub use gateway::{DeliveryOutcome, HANDLER_KEY, MessageBus, MessageHandler};
pub use memory::InMemoryBroker;
pub use nats::NatsBroker;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("not connected to the message broker")]
    NotConnected,
    #[error("publish did not complete within {0} ms")]
    PublishTimeout(u64),
    #[error("broker error: {0}")]
    Broker(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    pub nats_url: String,
    /// JetStream stream holding both subjects.
    pub stream: String,
    pub inbound_subject: String,
    pub outbound_subject: String,
    /// Durable consumer name on the inbound subject.
    pub consumer: String,
    /// Deliveries before a requeued message is dropped.
    pub max_deliver: i64,
    pub reconnect_delay: Duration,
    pub publish_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://127.0.0.1:4222".into(),
            stream: "SWITCHYARD".into(),
            inbound_subject: "switchyard.requests".into(),
            outbound_subject: "switchyard.responses".into(),
            consumer: "switchyard-orchestrator".into(),
            max_deliver: 5,
            reconnect_delay: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
        }
    }
}
