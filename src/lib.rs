//! # JetStream Events
//!
//! Client-side envelope and delivery layer for NATS JetStream.
//!
//! This crate sits between application code and the broker and solves two
//! problems:
//!
//! - **Envelope**: building and parsing the self-describing message envelope
//!   that carries an event identity, a serialized payload, and error state
//!   across the wire ([`EventMessage`], [`AuditLogMessage`]).
//! - **Delivery**: wrapping broker deliveries into a uniform at-least-once
//!   processing pipeline with bounded retries, a dead-letter handoff, and an
//!   acknowledge-always discipline ([`MessagePipeline`]).
//!
//! It does not reimplement the broker. Connection handling, stream
//! administration, and subscriptions are delegated to `async-nats` behind the
//! [`EventBus`] trait, with two implementations:
//!
//! - **[`JetStreamBus`]**: production implementation over NATS JetStream
//! - **[`InMemoryBus`]**: in-process implementation for tests and local dev
//!
//! ## Usage
//!
//! ```rust,no_run
//! use jetstream_events::{
//!     EventBus, EventMessage, InMemoryBus, MessagePipeline, NatsEvent, RetryPolicy,
//!     SubscribeOptions,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = InMemoryBus::new();
//! let stream = bus.subscribe("orders.events.created", SubscribeOptions::default()).await?;
//!
//! // Producer side: build an envelope and publish it.
//! let data = EventMessage::new()
//!     .with_event(NatsEvent { id: 42, user_id: 7, ..Default::default() })
//!     .with_body(&serde_json::json!({ "status": "created" }))
//!     .build()?;
//! bus.publish("orders.events.created", data).await?;
//!
//! // Consumer side: retry three times, one second apart, then give up.
//! let pipeline = Arc::new(MessagePipeline::<EventMessage>::new(
//!     RetryPolicy::new(3, Duration::from_secs(1)),
//!     |payload| async move {
//!         println!("received event {:?}", payload.event);
//!         Ok(())
//!     },
//! ));
//! pipeline.spawn(stream);
//! # Ok(())
//! # }
//! ```

mod audit;
mod envelope;
mod inmemory;
mod jetstream;
mod pipeline;
mod retry;

pub use audit::AuditLogMessage;
pub use envelope::{EnvelopeError, EventMessage, MessagePayload, NatsEvent};
pub use inmemory::InMemoryBus;
pub use jetstream::{connect, register_clients, safe_close, JetStreamBus, StreamClient};
pub use pipeline::{HandlerResult, MessagePipeline, PipelineError};
pub use retry::{retry_with_policy, RetryPolicy};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;

/// Acknowledgement handle carried by every delivered message.
///
/// Implementations are broker-specific; the pipeline only ever calls
/// [`Acker::ack`] once per message.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> BusResult<()>;
}

/// A message delivered from the event bus.
///
/// Unlike an outbound publish, an inbound message owns its acknowledgement
/// handle: whoever consumes the message decides when the broker may consider
/// it delivered.
pub struct BusMessage {
    /// The subject this message was published to
    pub subject: String,
    /// The message payload; `None` models a delivery without data
    pub payload: Option<Vec<u8>>,
    acker: Box<dyn Acker>,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: Option<Vec<u8>>, acker: Box<dyn Acker>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            acker,
        }
    }

    /// Acknowledge this message with the broker.
    pub async fn ack(&self) -> BusResult<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.as_ref().map(Vec::len))
            .finish()
    }
}

/// Declarative stream configuration passed to [`EventBus::add_stream`].
///
/// Kept bus-agnostic so the in-memory implementation can accept it too; the
/// JetStream implementation maps it onto the broker's stream config.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    /// Stream name (e.g. "ORDER_EVENTS")
    pub name: String,
    /// Subjects captured by the stream (e.g. `["orders.events.*"]`)
    pub subjects: Vec<String>,
    /// Message age limit; `None` keeps messages until other limits apply
    pub max_age: Option<Duration>,
    /// Use work-queue retention (each message consumed by exactly one group)
    pub work_queue: bool,
}

/// Options for [`EventBus::subscribe`] and [`EventBus::queue_subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Stream to bind to; resolved from the subject when absent
    pub stream: Option<String>,
    /// Durable consumer name; an ephemeral consumer is created when absent
    pub durable: Option<String>,
    /// Deliver all retained messages instead of only new ones
    pub deliver_all: bool,
}

/// Errors surfaced by event bus implementations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Sentinel returned by any broker-facing call made on a severed
    /// connection. Callers should check connection health before retrying.
    #[error("connection to the NATS server has been lost")]
    ConnectionLost,

    #[error("failed to connect to the NATS server: {0}")]
    Connection(String),

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to subscribe to subject: {0}")]
    Subscribe(String),

    #[error("stream administration failed: {0}")]
    Stream(String),

    #[error("failed to acknowledge message: {0}")]
    Ack(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core publish/subscribe abstraction over the message broker.
///
/// Subscriptions yield streams of [`BusMessage`]s, each carrying its own
/// acknowledgement handle. Implementations must provide ordered,
/// at-least-once delivery per subject; everything past delivery (retries,
/// fallback, acknowledgement) belongs to [`MessagePipeline`].
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message and wait for the broker's acknowledgement.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Subscribe to messages on a subject.
    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> BusResult<BoxStream<'static, BusMessage>>;

    /// Subscribe as a member of a queue group: each matching message is
    /// delivered to exactly one member of the group.
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
        options: SubscribeOptions,
    ) -> BusResult<BoxStream<'static, BusMessage>>;

    /// Declare a stream, updating it in place when it already exists.
    async fn add_stream(&self, config: StreamConfig) -> BusResult<()>;

    /// Whether the underlying connection is currently usable.
    fn is_connected(&self) -> bool;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
