use std::sync::Arc;

use async_nats::jetstream::{self, AckKind, consumer::PullConsumer, consumer::pull, stream};
use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{Acker, Broker, BusConfig, BusError, ConnectionState, Delivery};

fn broker_err(err: impl std::fmt::Display) -> BusError {
    BusError::Broker(err.to_string())
}

#[derive(Clone)]
struct Session {
    client: Client,
    jetstream: jetstream::Context,
}

/// JetStream-backed broker. One stream holds both subjects; requests are
/// read through a durable pull consumer filtered to the inbound subject.
pub struct NatsBroker {
    config: BusConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    session: RwLock<Option<Session>>,
}

impl NatsBroker {
    pub fn new(config: BusConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            state: Arc::new(state),
            session: RwLock::new(None),
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn session(&self) -> Result<Session, BusError> {
        self.session.read().await.clone().ok_or(BusError::NotConnected)
    }

    async fn dial(&self, events: mpsc::UnboundedSender<Event>) -> Result<Client, BusError> {
        let delay = self.config.reconnect_delay;
        loop {
            let tx = events.clone();
            let options = ConnectOptions::new()
                .name("switchyard")
                .event_callback(move |event| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(event);
                    }
                })
                .reconnect_delay_callback(move |attempts| {
                    debug!(attempts, "scheduling NATS reconnect");
                    delay
                });

            match options.connect(self.config.nats_url.as_str()).await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    if self.current_state() == ConnectionState::Closed {
                        return Err(BusError::NotConnected);
                    }
                    warn!(url = %self.config.nats_url, error = %err, retry_in_ms = delay.as_millis() as u64, "NATS connect failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Creates the stream if it is missing. Safe to repeat after a reconnect.
async fn declare_topology(
    js: &jetstream::Context,
    config: &BusConfig,
) -> Result<stream::Stream, BusError> {
    js.get_or_create_stream(stream::Config {
        name: config.stream.clone(),
        subjects: vec![config.inbound_subject.clone(), config.outbound_subject.clone()],
        ..Default::default()
    })
    .await
    .map_err(broker_err)
}

async fn declare_consumer(stream: &stream::Stream, config: &BusConfig) -> Result<PullConsumer, BusError> {
    stream
        .get_or_create_consumer(
            &config.consumer,
            pull::Config {
                durable_name: Some(config.consumer.clone()),
                filter_subject: config.inbound_subject.clone(),
                ack_policy: jetstream::consumer::AckPolicy::Explicit,
                max_ack_pending: 1,
                max_deliver: config.max_deliver,
                ..Default::default()
            },
        )
        .await
        .map_err(broker_err)
}

/// Follows client events: mirrors them into the state channel and
/// re-declares the topology every time the connection comes back.
async fn watch_events(
    mut events: mpsc::UnboundedReceiver<Event>,
    state: Arc<watch::Sender<ConnectionState>>,
    js: jetstream::Context,
    config: BusConfig,
) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Connected => {
                info!(url = %config.nats_url, "connected to NATS");
                if let Err(err) = declare_topology(&js, &config).await {
                    error!(error = %err, "failed to re-declare stream after reconnect");
                }
                state.send_replace(ConnectionState::Connected);
            }
            Event::Disconnected => {
                warn!("NATS connection lost; reconnecting");
                state.send_replace(ConnectionState::Disconnected);
            }
            Event::Closed => {
                state.send_replace(ConnectionState::Closed);
                break;
            }
            other => debug!(event = %other, "NATS event"),
        }
    }
}

struct NatsAcker(jetstream::Message);

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.0.ack().await.map_err(broker_err)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BusError> {
        let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
        self.0.ack_with(kind).await.map_err(broker_err)
    }
}

#[async_trait]
impl Broker for NatsBroker {
    #[tracing::instrument(name = "nats_connect", skip(self), fields(url = %self.config.nats_url))]
    async fn connect(&self) -> Result<(), BusError> {
        let mut session = self.session.write().await;
        if session.is_some() {
            return Ok(());
        }
        self.state.send_replace(ConnectionState::Connecting);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = self.dial(events_tx).await?;
        let js = jetstream::new(client.clone());
        declare_topology(&js, &self.config).await?;

        tokio::spawn(watch_events(events_rx, self.state.clone(), js.clone(), self.config.clone()));
        self.state.send_replace(ConnectionState::Connected);
        *session = Some(Session { client, jetstream: js });
        Ok(())
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn consume(&self) -> Result<BoxStream<'static, Result<Delivery, BusError>>, BusError> {
        let session = self.session().await?;
        let stream = declare_topology(&session.jetstream, &self.config).await?;
        let consumer = declare_consumer(&stream, &self.config).await?;
        let messages = consumer.messages().await.map_err(broker_err)?;
        info!(consumer = %self.config.consumer, subject = %self.config.inbound_subject, "consuming");

        Ok(messages
            .map(|item| {
                let msg = item.map_err(broker_err)?;
                let delivered = msg.info().map(|i| i.delivered.max(1) as u64).unwrap_or(1);
                Ok(Delivery {
                    payload: msg.payload.clone(),
                    delivered,
                    acker: Box::new(NatsAcker(msg)),
                })
            })
            .boxed())
    }

    async fn publish(&self, payload: Bytes) -> Result<(), BusError> {
        if self.current_state() != ConnectionState::Connected {
            return Err(BusError::NotConnected);
        }
        let session = self.session().await?;
        let ack = session
            .jetstream
            .publish(self.config.outbound_subject.clone(), payload)
            .await
            .map_err(broker_err)?;
        ack.await.map_err(broker_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.state.send_replace(ConnectionState::Closed);
        if let Some(session) = self.session.write().await.take() {
            session.client.drain().await.map_err(broker_err)?;
            info!("NATS connection drained");
        }
        Ok(())
    }
}
