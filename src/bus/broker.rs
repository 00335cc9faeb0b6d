use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use tokio::sync::watch;

use super::{BusError, ConnectionState};

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;
    /// `requeue = false` drops the message for good.
    async fn reject(&self, requeue: bool) -> Result<(), BusError>;
}

/// One message pulled from the inbound queue, not yet settled.
pub struct Delivery {
    pub payload: Bytes,
    /// How many times the broker has handed this message out, starting at 1.
    pub delivered: u64,
    pub acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.payload.len())
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

/// Durable queue transport underneath [`super::MessageBus`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connects and declares the inbound and outbound queues. Idempotent.
    async fn connect(&self) -> Result<(), BusError>;

    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Deliveries from the inbound queue, one unacknowledged message at a
    /// time. The stream ends when the broker is closed.
    async fn consume(&self) -> Result<BoxStream<'static, Result<Delivery, BusError>>, BusError>;

    /// Persistent publish to the outbound queue; returns once the broker has
    /// confirmed it.
    async fn publish(&self, payload: Bytes) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;
}
