use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use switchyard_protocol::BusMessage;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, warn};

use super::{Acker, Broker, BusError, ConnectionState, Delivery};

struct Queued {
    payload: Bytes,
    delivered: u64,
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    tx: mpsc::UnboundedSender<Queued>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>>,
    published: Mutex<Vec<Bytes>>,
    published_signal: Notify,
    acked: AtomicUsize,
    rejected: AtomicUsize,
    dead_lettered: AtomicUsize,
    max_deliver: u64,
    publish_delay: Mutex<Option<Duration>>,
}

/// In-process broker with the same delivery semantics as the NATS one:
/// one delivery at a time, explicit settlement, requeue up to a delivery
/// cap. Published replies are kept for inspection.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new(max_deliver: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                state,
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
                published: Mutex::new(Vec::new()),
                published_signal: Notify::new(),
                acked: AtomicUsize::new(0),
                rejected: AtomicUsize::new(0),
                dead_lettered: AtomicUsize::new(0),
                max_deliver: max_deliver.max(1),
                publish_delay: Mutex::new(None),
            }),
        }
    }

    /// Places a raw payload on the inbound queue.
    pub fn inject(&self, payload: impl Into<Bytes>) {
        let _ = self.shared.tx.send(Queued {
            payload: payload.into(),
            delivered: 1,
        });
    }

    pub fn inject_message(&self, msg: &BusMessage) -> Result<(), BusError> {
        self.inject(msg.to_vec()?);
        Ok(())
    }

    /// Simulates a lost connection.
    pub fn disconnect(&self) {
        self.shared.state.send_replace(ConnectionState::Disconnected);
    }

    /// Holds every publish for `delay` before confirming it.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *self.shared.publish_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn published(&self) -> Vec<BusMessage> {
        self.shared
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|raw| BusMessage::from_slice(raw).ok())
            .collect()
    }

    /// Waits until at least `count` replies were published or `timeout`
    /// elapses, then returns whatever was published.
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> Vec<BusMessage> {
        let wait = async {
            loop {
                let notified = self.shared.published_signal.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.published_len() >= count {
                    return;
                }
                notified.await;
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.published()
    }

    fn current_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    fn published_len(&self) -> usize {
        self.shared.published.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn acked(&self) -> usize {
        self.shared.acked.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.shared.rejected.load(Ordering::SeqCst)
    }

    pub fn dead_lettered(&self) -> usize {
        self.shared.dead_lettered.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(5)
    }
}

async fn until_closed(mut state: watch::Receiver<ConnectionState>) {
    loop {
        if *state.borrow_and_update() == ConnectionState::Closed {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    payload: Bytes,
    delivered: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.shared.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), BusError> {
        self.shared.rejected.fetch_add(1, Ordering::SeqCst);
        if requeue && self.delivered < self.shared.max_deliver {
            debug!(delivered = self.delivered, "requeueing message");
            let _ = self.shared.tx.send(Queued {
                payload: self.payload.clone(),
                delivered: self.delivered + 1,
            });
        } else {
            if requeue {
                warn!(delivered = self.delivered, "delivery cap reached; dropping message");
            }
            self.shared.dead_lettered.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<(), BusError> {
        self.shared.state.send_replace(ConnectionState::Connected);
        Ok(())
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    async fn consume(&self) -> Result<BoxStream<'static, Result<Delivery, BusError>>, BusError> {
        if self.current_state() != ConnectionState::Connected {
            return Err(BusError::NotConnected);
        }
        let shared = self.shared.clone();
        let deliveries = stream::unfold(shared, |shared| async move {
            let closed = shared.state.subscribe();
            let next = {
                let mut rx = shared.rx.lock().await;
                tokio::select! {
                    item = rx.recv() => item,
                    _ = until_closed(closed) => None,
                }
            };
            let queued = next?;
            let delivery = Delivery {
                payload: queued.payload.clone(),
                delivered: queued.delivered,
                acker: Box::new(MemoryAcker {
                    shared: shared.clone(),
                    payload: queued.payload,
                    delivered: queued.delivered,
                }),
            };
            Some((Ok(delivery), shared))
        });
        Ok(deliveries.boxed())
    }

    async fn publish(&self, payload: Bytes) -> Result<(), BusError> {
        if self.current_state() != ConnectionState::Connected {
            return Err(BusError::NotConnected);
        }
        let delay = *self.shared.publish_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.shared
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload);
        self.shared.published_signal.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.shared.state.send_replace(ConnectionState::Closed);
        Ok(())
    }
}
