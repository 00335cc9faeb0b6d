use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use switchyard_protocol::{HealthStatus, IncomingMessage, OutgoingMessage};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Broker, BusConfig, BusError, ConnectionState, Delivery};

/// Inbound messages are dispatched to the handler registered under this name.
pub const HANDLER_KEY: &str = "orchestrator";

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// An `Err` requeues the message for another delivery.
    async fn handle(&self, message: IncomingMessage) -> anyhow::Result<()>;
}

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    /// Acknowledged without dispatch (a reply that came back around).
    Skipped,
    Rejected { requeue: bool },
}

struct Listener {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

pub struct MessageBus {
    broker: Arc<dyn Broker>,
    config: BusConfig,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    listener: Mutex<Option<Listener>>,
}

impl MessageBus {
    pub fn new(broker: Arc<dyn Broker>, config: BusConfig) -> Arc<Self> {
        Arc::new(Self {
            broker,
            config,
            handlers: DashMap::new(),
            listener: Mutex::new(None),
        })
    }

    pub async fn connect(&self) -> Result<(), BusError> {
        self.broker.connect().await
    }

    pub fn state(&self) -> ConnectionState {
        let state = self.broker.state();
        let current = *state.borrow();
        current
    }

    /// Resolves once the broker reports `Connected`.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), BusError> {
        let mut state = self.broker.state();
        let wait = async {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Closed => return Err(BusError::NotConnected),
                    _ => {}
                }
                if state.changed().await.is_err() {
                    return Err(BusError::NotConnected);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BusError::NotConnected)?
    }

    pub fn register_handler(&self, name: &str, handler: Arc<dyn MessageHandler>) {
        if name != HANDLER_KEY {
            warn!(name, expected = HANDLER_KEY, "handler registered under a name that is never dispatched to");
        }
        self.handlers.insert(name.to_string(), handler);
    }

    /// Starts consuming the inbound queue. Deliveries are processed one at a
    /// time, in order. Calling it again while listening is a no-op.
    pub async fn start_listening(self: &Arc<Self>) -> Result<(), BusError> {
        if self.listener_guard().is_some() {
            return Ok(());
        }
        let mut deliveries = self.broker.consume().await?;
        let stop = CancellationToken::new();
        let token = stop.clone();
        let bus = self.clone();

        let task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = deliveries.next() => next,
                };
                match next {
                    Some(Ok(delivery)) => {
                        let outcome = bus.process_delivery(delivery).await;
                        debug!(?outcome, "delivery settled");
                    }
                    Some(Err(err)) => warn!(error = %err, "failed to receive delivery"),
                    None => {
                        info!("inbound stream ended");
                        break;
                    }
                }
            }
        });

        info!(subject = %self.config.inbound_subject, "listening for requests");
        *self.listener_guard() = Some(Listener { stop, task });
        Ok(())
    }

    fn listener_guard(&self) -> std::sync::MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stops consuming after the delivery in progress, if any, is settled.
    pub async fn stop_listening(&self) {
        let listener = self.listener_guard().take();
        if let Some(Listener { stop, task }) = listener {
            stop.cancel();
            if let Err(err) = task.await {
                warn!(error = %err, "listener task ended abnormally");
            }
            info!("stopped listening");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener_guard().is_some()
    }

    /// Parses, dispatches and settles one delivery.
    pub async fn process_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        let Delivery {
            payload,
            delivered,
            acker,
        } = delivery;

        let outcome = match IncomingMessage::from_slice(&payload) {
            Err(err) => {
                warn!(error = %err, delivered, "dropping invalid message");
                DeliveryOutcome::Rejected { requeue: false }
            }
            Ok(msg) if msg.is_response() => {
                debug!(id = %msg.id, "skipping response message");
                DeliveryOutcome::Skipped
            }
            Ok(msg) => {
                let handler = self.handlers.get(HANDLER_KEY).map(|h| h.value().clone());
                match handler {
                    None => {
                        error!(id = %msg.id, "no message handler registered; dropping message");
                        DeliveryOutcome::Rejected { requeue: false }
                    }
                    Some(handler) => {
                        let id = msg.id.clone();
                        match handler.handle(msg).await {
                            Ok(()) => DeliveryOutcome::Acked,
                            Err(err) => {
                                warn!(id = %id, delivered, error = %format!("{err:#}"), "handler failed; requeueing");
                                DeliveryOutcome::Rejected { requeue: true }
                            }
                        }
                    }
                }
            }
        };

        let settled = match outcome {
            DeliveryOutcome::Acked | DeliveryOutcome::Skipped => acker.ack().await,
            DeliveryOutcome::Rejected { requeue } => acker.reject(requeue).await,
        };
        if let Err(err) = settled {
            error!(error = %err, ?outcome, "failed to settle delivery");
        }
        outcome
    }

    /// Validates and publishes `message`, waiting at most the configured
    /// publish timeout for the broker's confirmation.
    #[tracing::instrument(name = "bus_send", skip(self, message), fields(id = %message.id))]
    pub async fn send_message(&self, message: &OutgoingMessage) -> Result<(), BusError> {
        let payload = Bytes::from(message.to_vec()?);
        let timeout = self.config.publish_timeout;
        match tokio::time::timeout(timeout, self.broker.publish(payload)).await {
            Ok(result) => result,
            Err(_) => {
                error!(timeout_ms = timeout.as_millis() as u64, "publish was not confirmed in time");
                Err(BusError::PublishTimeout(timeout.as_millis() as u64))
            }
        }
    }

    pub async fn close(&self) -> Result<(), BusError> {
        self.stop_listening().await;
        self.broker.close().await
    }

    pub fn health(&self) -> HealthStatus {
        match self.state() {
            ConnectionState::Connected => HealthStatus::healthy(
                "message_bus",
                if self.is_listening() { "connected, listening" } else { "connected" },
            ),
            other => HealthStatus::unhealthy("message_bus", format!("broker is {other:?}").to_lowercase()),
        }
    }
}
