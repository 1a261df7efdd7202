//! NATS JetStream implementation of the [`EventBus`] trait, plus the
//! connection lifecycle: client registration, reconnect handling, and
//! draining.

use crate::{Acker, BusError, BusMessage, BusResult, EventBus, StreamConfig, SubscribeOptions};
use async_nats::connection::State;
use async_nats::jetstream::consumer::{pull, DeliverPolicy};
use async_nats::jetstream::{self, stream};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Production [`EventBus`] over NATS JetStream.
///
/// Wraps an already-connected [`async_nats::Client`]. Every broker-facing
/// call checks connection health first and returns
/// [`BusError::ConnectionLost`] on a severed connection, so callers can
/// distinguish "the broker said no" from "there is no broker right now".
pub struct JetStreamBus {
    client: Client,
    context: jetstream::Context,
}

impl JetStreamBus {
    pub fn new(client: Client) -> Self {
        let context = jetstream::new(client.clone());
        Self { client, context }
    }

    /// The underlying NATS client, for callers that need direct access to
    /// features not exposed through [`EventBus`].
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The underlying JetStream context.
    pub fn context(&self) -> &jetstream::Context {
        &self.context
    }

    /// Broker-side state of a durable consumer.
    pub async fn consumer_info(
        &self,
        stream_name: &str,
        consumer_name: &str,
    ) -> BusResult<jetstream::consumer::Info> {
        if !self.is_connected() {
            return Err(BusError::ConnectionLost);
        }
        let stream = self
            .context
            .get_stream(stream_name)
            .await
            .map_err(|err| BusError::Stream(err.to_string()))?;
        let mut consumer: jetstream::consumer::Consumer<pull::Config> = stream
            .get_consumer(consumer_name)
            .await
            .map_err(|err| BusError::Stream(err.to_string()))?;
        let info = consumer
            .info()
            .await
            .map_err(|err| BusError::Stream(err.to_string()))?;
        Ok(info.clone())
    }

    async fn consumer_stream(
        &self,
        subject: &str,
        durable: Option<String>,
        options: &SubscribeOptions,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        if !self.is_connected() {
            return Err(BusError::ConnectionLost);
        }

        let stream = match &options.stream {
            Some(name) => self
                .context
                .get_stream(name)
                .await
                .map_err(|err| BusError::Subscribe(err.to_string()))?,
            None => {
                let name = self
                    .context
                    .stream_by_subject(subject)
                    .await
                    .map_err(|err| BusError::Subscribe(err.to_string()))?;
                self.context
                    .get_stream(name)
                    .await
                    .map_err(|err| BusError::Subscribe(err.to_string()))?
            }
        };

        let config = pull::Config {
            durable_name: durable.clone(),
            filter_subject: subject.to_string(),
            deliver_policy: if options.deliver_all {
                DeliverPolicy::All
            } else {
                DeliverPolicy::New
            },
            ..Default::default()
        };

        let consumer = match &durable {
            Some(name) => stream
                .get_or_create_consumer(name, config)
                .await
                .map_err(|err| BusError::Subscribe(err.to_string()))?,
            None => stream
                .create_consumer(config)
                .await
                .map_err(|err| BusError::Subscribe(err.to_string()))?,
        };

        let messages = consumer
            .messages()
            .await
            .map_err(|err| BusError::Subscribe(err.to_string()))?;

        let adapted = messages.filter_map(|message| async move {
            match message {
                Ok(message) => {
                    let subject = message.subject.to_string();
                    let payload = Some(message.payload.to_vec());
                    Some(BusMessage::new(
                        subject,
                        payload,
                        Box::new(JetStreamAcker(message)) as Box<dyn Acker>,
                    ))
                }
                Err(err) => {
                    warn!(error = %err, "dropping failed message pull");
                    None
                }
            }
        });

        Ok(adapted.boxed())
    }
}

struct JetStreamAcker(jetstream::Message);

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> BusResult<()> {
        self.0
            .ack()
            .await
            .map_err(|err| BusError::Ack(err.to_string()))
    }
}

#[async_trait]
impl EventBus for JetStreamBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::ConnectionLost);
        }
        let ack = self
            .context
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|err| BusError::Publish(err.to_string()))?;
        ack.await
            .map_err(|err| BusError::Publish(err.to_string()))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        self.consumer_stream(subject, options.durable.clone(), &options)
            .await
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
        options: SubscribeOptions,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        // queue members share one durable consumer, so each message is
        // delivered to exactly one member
        let durable = options
            .durable
            .clone()
            .unwrap_or_else(|| queue.to_string());
        self.consumer_stream(subject, Some(durable), &options).await
    }

    async fn add_stream(&self, config: StreamConfig) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::ConnectionLost);
        }

        let stream_config = stream::Config {
            name: config.name.clone(),
            subjects: config.subjects.clone(),
            max_age: config.max_age.unwrap_or_default(),
            retention: if config.work_queue {
                stream::RetentionPolicy::WorkQueue
            } else {
                stream::RetentionPolicy::Limits
            },
            ..Default::default()
        };

        if self.context.get_stream(&config.name).await.is_ok() {
            self.context
                .update_stream(&stream_config)
                .await
                .map_err(|err| BusError::Stream(err.to_string()))?;
        } else {
            self.context
                .create_stream(stream_config)
                .await
                .map_err(|err| BusError::Stream(err.to_string()))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }
}

/// A downstream client wired into the startup sequence.
///
/// Every client receives the live bus handle; clients that own streams or
/// subscriptions override the corresponding hook. The defaults make both
/// capabilities opt-in.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Receive the live bus handle. Called for every client before any
    /// stream initialization or subscription happens.
    fn register_bus(&self, bus: Arc<dyn EventBus>);

    /// Declare or update the streams this client owns.
    async fn init_stream(&self) -> BusResult<()> {
        Ok(())
    }

    /// Register this client's subscriptions.
    async fn subscribe_events(&self) -> BusResult<()> {
        Ok(())
    }
}

/// Run the registration sequence: bus handles for all clients, then stream
/// init for all clients, then subscriptions for all clients.
///
/// A failure at any step aborts the remaining steps and surfaces the error.
/// The sequence is idempotent, so it is safe to replay after a reconnect.
pub async fn register_clients(
    bus: Arc<dyn EventBus>,
    clients: &[Arc<dyn StreamClient>],
) -> BusResult<()> {
    for client in clients {
        client.register_bus(bus.clone());
    }

    for client in clients {
        if let Err(err) = client.init_stream().await {
            error!(error = %err, "stream initialization failed");
            return Err(err);
        }
    }

    for client in clients {
        if let Err(err) = client.subscribe_events().await {
            error!(error = %err, "subscription registration failed");
            return Err(err);
        }
    }

    Ok(())
}

/// Connect to NATS, register all clients, and keep them registered across
/// reconnects.
///
/// Connection-state transitions are logged; after every reconnection the
/// same registration sequence is replayed against the live bus so durable
/// streams and subscriptions come back without caller involvement.
pub async fn connect(
    url: &str,
    clients: Vec<Arc<dyn StreamClient>>,
) -> BusResult<Arc<JetStreamBus>> {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();

    let client = async_nats::ConnectOptions::new()
        .event_callback(move |event| {
            let event_tx = event_tx.clone();
            async move {
                match &event {
                    async_nats::Event::Disconnected => error!("NATS connection lost"),
                    async_nats::Event::Connected => info!("NATS connection established"),
                    other => debug!(event = %other, "NATS connection event"),
                }
                let _ = event_tx.send(event);
            }
        })
        .connect(url)
        .await
        .map_err(|err| {
            error!(error = %err, url = %url, "failed to connect to NATS");
            BusError::Connection(err.to_string())
        })?;

    let bus = Arc::new(JetStreamBus::new(client));
    register_clients(bus.clone(), &clients).await?;

    let watcher_bus = bus.clone();
    tokio::spawn(async move {
        let mut lost = false;
        while let Some(event) = event_rx.recv().await {
            match event {
                async_nats::Event::Disconnected => lost = true,
                async_nats::Event::Connected if lost => {
                    lost = false;
                    info!("NATS reconnected, re-registering clients");
                    if let Err(err) = register_clients(watcher_bus.clone(), &clients).await {
                        error!(error = %err, "failed to re-register clients after reconnect");
                    }
                }
                _ => {}
            }
        }
    });

    Ok(bus)
}

/// Drain the connection behind the bus, if it is still up. Safe to call on
/// an already-severed connection; a drain failure is logged, not returned.
pub async fn safe_close(bus: &JetStreamBus) {
    if !bus.is_connected() {
        return;
    }
    if let Err(err) = bus.client().drain().await {
        error!(error = %err, "draining NATS connection failed");
    }
}
