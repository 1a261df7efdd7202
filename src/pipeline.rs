//! # Delivery Pipeline
//!
//! Adapts an application-level processing function into the shape required
//! by a broker subscription, with bounded retry, an optional dead-letter
//! fallback, and a guaranteed acknowledgement.
//!
//! Per delivered message the pipeline moves through
//! `Received -> Parsed -> Processing(attempt 1..N) -> {Succeeded | Exhausted
//! -> Fallback}` and acknowledges from every path, including malformed and
//! payload-less deliveries. Acknowledging poison messages instead of letting
//! the broker redeliver them keeps the consumer progressing; the fallback
//! handler is the escape hatch for messages that never succeed.
//!
//! The pipeline never fails outward: every terminal state is logged, not
//! propagated, because the broker's dispatch mechanism has no use for a
//! returned error.

use crate::envelope::MessagePayload;
use crate::retry::{retry_with_policy, RetryPolicy};
use crate::BusMessage;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Distinguished terminal conditions logged by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Processing failed on every attempt and was handed to the fallback
    #[error("gave up processing message payload")]
    GiveUp,

    /// The delivery carried no payload at all
    #[error("message payload is missing")]
    MissingPayload,
}

/// Outcome of a processing or fallback invocation.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Handler<P> = Box<dyn Fn(Arc<P>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// The delivery/retry/acknowledge adapter around a processing function.
///
/// Generic over the payload type, which only needs the [`MessagePayload`]
/// capability set plus `Default` so a fresh instance can be parsed per
/// delivery. Retries within one message are strictly sequential; separate
/// messages may be dispatched concurrently by separate workers since the
/// pipeline holds no shared mutable state.
pub struct MessagePipeline<P> {
    retry: RetryPolicy,
    handler: Handler<P>,
    fallback: Option<Handler<P>>,
}

impl<P> MessagePipeline<P>
where
    P: MessagePayload + Default + Send + Sync + 'static,
{
    /// Create a pipeline around a processing function.
    pub fn new<H, Fut>(retry: RetryPolicy, handler: H) -> Self
    where
        H: Fn(Arc<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            retry,
            handler: Box::new(move |payload| Box::pin(handler(payload))),
            fallback: None,
        }
    }

    /// Attach a fallback handler, invoked exactly once with the parsed
    /// payload after all processing attempts fail. Without one, exhaustion
    /// is a legitimate terminal state and is only logged.
    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn(Arc<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.fallback = Some(Box::new(move |payload| Box::pin(fallback(payload))));
        self
    }

    /// Handle one delivered message, then acknowledge it.
    ///
    /// The acknowledgement happens regardless of which branch processing
    /// took; an ack failure is logged and the broker may redeliver later,
    /// which processing functions must tolerate (idempotence is a caller
    /// obligation).
    pub async fn dispatch(&self, message: BusMessage) {
        self.process(&message).await;

        if let Err(err) = message.ack().await {
            error!(
                subject = %message.subject,
                error = %err,
                "failed to acknowledge message"
            );
        }
    }

    async fn process(&self, message: &BusMessage) {
        let Some(data) = message.payload.as_deref() else {
            error!(
                subject = %message.subject,
                cause = %PipelineError::MissingPayload,
                "dropping message without payload"
            );
            return;
        };

        let mut payload = P::default();
        if let Err(err) = payload.parse_from_bytes(data) {
            // retrying will not change the outcome of a failed parse
            error!(
                subject = %message.subject,
                error = %err,
                "failed to decode message payload"
            );
            return;
        }
        payload.add_subject(&message.subject);
        let payload = Arc::new(payload);

        let result = retry_with_policy(
            || (self.handler)(payload.clone()),
            &self.retry,
            &message.subject,
        )
        .await;

        let Err(err) = result else {
            debug!(subject = %message.subject, "message processed");
            return;
        };

        error!(
            subject = %message.subject,
            error = %err,
            cause = %PipelineError::GiveUp,
            payload = %dump_payload(payload.as_ref()),
            "exhausted all processing attempts"
        );

        let Some(fallback) = &self.fallback else {
            return;
        };

        warn!(subject = %message.subject, "handing message over to the fallback handler");
        if let Err(err) = fallback(payload.clone()).await {
            error!(
                subject = %message.subject,
                error = %err,
                payload = %dump_payload(payload.as_ref()),
                "fallback handler failed"
            );
        }
    }

    /// Drain a subscription, dispatching every message in order.
    pub async fn run(&self, mut stream: BoxStream<'static, BusMessage>) {
        while let Some(message) = stream.next().await {
            self.dispatch(message).await;
        }
        warn!("message stream ended");
    }

    /// Spawn [`MessagePipeline::run`] on a background task.
    pub fn spawn(self: Arc<Self>, stream: BoxStream<'static, BusMessage>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(stream).await })
    }
}

fn dump_payload<P: MessagePayload>(payload: &P) -> String {
    payload
        .to_json()
        .unwrap_or_else(|_| String::from("<payload not serializable>"))
}
