//! In-memory implementation of the [`EventBus`] trait for tests and local
//! development.
//!
//! Messages are fanned out over a tokio broadcast channel to plain
//! subscribers and over per-group mpsc channels to queue subscribers, with
//! NATS-style subject pattern matching (`*` matches one token, `>` matches
//! the rest). Acknowledgements are recorded so tests can assert on the
//! exactly-once-ack discipline of the delivery pipeline.

use crate::{Acker, BusMessage, BusResult, EventBus, StreamConfig, SubscribeOptions};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

type RawMessage = (String, Option<Vec<u8>>);

#[derive(Clone)]
struct QueueGroup {
    sender: mpsc::UnboundedSender<RawMessage>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RawMessage>>>,
}

/// In-process event bus backed by channels.
///
/// Suitable for unit tests, integration tests, and development without a
/// broker. The broadcast buffer holds 1000 messages; a lagging subscriber
/// skips the overwritten ones.
///
/// # Example
/// ```rust
/// use jetstream_events::{EventBus, InMemoryBus, SubscribeOptions};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// let mut stream = bus.subscribe("test.events.>", SubscribeOptions::default()).await?;
///
/// bus.publish("test.events.created", b"hello".to_vec()).await?;
///
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.subject, "test.events.created");
/// msg.ack().await?;
/// assert_eq!(bus.ack_count(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    sender: broadcast::Sender<RawMessage>,
    queues: Arc<Mutex<HashMap<(String, String), QueueGroup>>>,
    streams: Arc<Mutex<Vec<StreamConfig>>>,
    acked: Arc<Mutex<Vec<String>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a bus with a custom broadcast buffer size.
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender,
            queues: Arc::new(Mutex::new(HashMap::new())),
            streams: Arc::new(Mutex::new(Vec::new())),
            acked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subjects of every message acknowledged so far, in ack order.
    pub fn acked_subjects(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    /// Number of acknowledgements recorded so far.
    pub fn ack_count(&self) -> usize {
        self.acked.lock().unwrap().len()
    }

    /// Stream configs declared through [`EventBus::add_stream`].
    pub fn streams(&self) -> Vec<StreamConfig> {
        self.streams.lock().unwrap().clone()
    }

    /// Check if a subject matches a subscription pattern.
    ///
    /// - `*` matches exactly one token
    /// - `>` matches one or more trailing tokens
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            let pattern_token = pattern_tokens[p_idx];

            if pattern_token == ">" {
                return true;
            } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
                s_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }

    fn wrap(&self, raw: RawMessage) -> BusMessage {
        let (subject, payload) = raw;
        let acker = RecordingAcker {
            subject: subject.clone(),
            acked: self.acked.clone(),
        };
        BusMessage::new(subject, payload, Box::new(acker))
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

struct RecordingAcker {
    subject: String,
    acked: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Acker for RecordingAcker {
    async fn ack(&self) -> BusResult<()> {
        self.acked.lock().unwrap().push(self.subject.clone());
        Ok(())
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        let raw: RawMessage = (subject.to_string(), Some(payload));

        // one copy per matching queue group
        for ((pattern, _queue), group) in self.queues.lock().unwrap().iter() {
            if Self::matches_pattern(subject, pattern) {
                let _ = group.sender.send(raw.clone());
            }
        }

        // broadcast to plain subscribers; no receivers is fine
        let _ = self.sender.send(raw);
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        _options: SubscribeOptions,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = self.sender.subscribe();
        let pattern = subject.to_string();
        let bus = self.clone();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(raw) => {
                        if Self::matches_pattern(&raw.0, &pattern) {
                            yield bus.wrap(raw);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "in-memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
        _options: SubscribeOptions,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        let group = {
            let mut queues = self.queues.lock().unwrap();
            queues
                .entry((subject.to_string(), queue.to_string()))
                .or_insert_with(|| {
                    let (sender, receiver) = mpsc::unbounded_channel();
                    QueueGroup {
                        sender,
                        receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                    }
                })
                .clone()
        };
        let bus = self.clone();

        // members take turns pulling from the shared group channel
        let stream = async_stream::stream! {
            loop {
                let raw = group.receiver.lock().await.recv().await;
                match raw {
                    Some(raw) => yield bus.wrap(raw),
                    None => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn add_stream(&self, config: StreamConfig) -> BusResult<()> {
        let mut streams = self.streams.lock().unwrap();
        // create-or-update, keyed by name
        if let Some(existing) = streams.iter_mut().find(|s| s.name == config.name) {
            *existing = config;
        } else {
            streams.push(config);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn pattern_matching() {
        // exact
        assert!(InMemoryBus::matches_pattern(
            "orders.events.created",
            "orders.events.created"
        ));

        // single-token wildcard
        assert!(InMemoryBus::matches_pattern(
            "orders.events.created",
            "orders.*.created"
        ));
        assert!(!InMemoryBus::matches_pattern(
            "orders.events.user.created",
            "orders.*.created"
        ));

        // tail wildcard
        assert!(InMemoryBus::matches_pattern("orders.events.created", "orders.>"));
        assert!(!InMemoryBus::matches_pattern("billing.events.created", "orders.>"));

        // edge cases
        assert!(InMemoryBus::matches_pattern("single", "*"));
        assert!(InMemoryBus::matches_pattern("single", ">"));
        assert!(!InMemoryBus::matches_pattern("one.two", "one"));
    }

    #[tokio::test]
    async fn publish_and_subscribe() {
        let bus = InMemoryBus::new();
        let mut stream = bus
            .subscribe("test.events.>", SubscribeOptions::default())
            .await
            .unwrap();

        let payload = b"test message".to_vec();
        bus.publish("test.events.created", payload.clone())
            .await
            .unwrap();

        let msg = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");

        assert_eq!(msg.subject, "test.events.created");
        assert_eq!(msg.payload.as_deref(), Some(payload.as_slice()));
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let bus = InMemoryBus::new();
        let mut stream = bus
            .subscribe("test.>", SubscribeOptions::default())
            .await
            .unwrap();

        for i in 0..5 {
            bus.publish(&format!("test.msg.{i}"), format!("message {i}").into_bytes())
                .await
                .unwrap();
        }

        for i in 0..5 {
            let msg = timeout(Duration::from_secs(1), stream.next())
                .await
                .expect("timeout")
                .expect("stream ended");
            assert_eq!(msg.subject, format!("test.msg.{i}"));
        }
    }

    #[tokio::test]
    async fn subscribers_only_see_matching_subjects() {
        let bus = InMemoryBus::new();
        let mut stream = bus
            .subscribe("orders.events.*", SubscribeOptions::default())
            .await
            .unwrap();

        bus.publish("orders.events.created", b"match".to_vec()).await.unwrap();
        bus.publish("orders.events.user.created", b"too deep".to_vec())
            .await
            .unwrap();
        bus.publish("billing.events.created", b"wrong prefix".to_vec())
            .await
            .unwrap();
        bus.publish("orders.events.deleted", b"match".to_vec()).await.unwrap();

        let first = timeout(Duration::from_millis(200), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(first.subject, "orders.events.created");

        let second = timeout(Duration::from_millis(200), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(second.subject, "orders.events.deleted");
    }

    #[tokio::test]
    async fn every_plain_subscriber_receives_the_message() {
        let bus = InMemoryBus::new();
        let mut first = bus.subscribe("test.>", SubscribeOptions::default()).await.unwrap();
        let mut second = bus.subscribe("test.>", SubscribeOptions::default()).await.unwrap();

        bus.publish("test.msg", b"broadcast".to_vec()).await.unwrap();

        let one = timeout(Duration::from_secs(1), first.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        let two = timeout(Duration::from_secs(1), second.next())
            .await
            .expect("timeout")
            .expect("stream ended");

        assert_eq!(one.payload, two.payload);
    }

    #[tokio::test]
    async fn queue_group_delivers_each_message_to_one_member() {
        let bus = InMemoryBus::new();
        let mut first = bus
            .queue_subscribe("jobs.>", "workers", SubscribeOptions::default())
            .await
            .unwrap();
        let mut second = bus
            .queue_subscribe("jobs.>", "workers", SubscribeOptions::default())
            .await
            .unwrap();

        for i in 0..4u8 {
            bus.publish(&format!("jobs.run.{i}"), vec![i]).await.unwrap();
        }

        // pull all four through whichever members get them
        let mut received = Vec::new();
        for _ in 0..4 {
            let msg = timeout(Duration::from_secs(1), async {
                tokio::select! {
                    Some(msg) = first.next() => msg,
                    Some(msg) = second.next() => msg,
                }
            })
            .await
            .expect("timeout");
            received.push(msg.subject.clone());
        }

        received.sort();
        assert_eq!(
            received,
            vec!["jobs.run.0", "jobs.run.1", "jobs.run.2", "jobs.run.3"]
        );

        // nothing left for either member
        let leftovers = timeout(Duration::from_millis(100), async {
            tokio::select! {
                msg = first.next() => msg,
                msg = second.next() => msg,
            }
        })
        .await;
        assert!(leftovers.is_err(), "queue delivered a message twice");
    }

    #[tokio::test]
    async fn acks_are_recorded() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("test.>", SubscribeOptions::default()).await.unwrap();

        bus.publish("test.msg", b"payload".to_vec()).await.unwrap();
        let msg = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");

        assert_eq!(bus.ack_count(), 0);
        msg.ack().await.unwrap();
        assert_eq!(bus.ack_count(), 1);
        assert_eq!(bus.acked_subjects(), vec!["test.msg".to_string()]);
    }

    #[tokio::test]
    async fn add_stream_records_and_updates_configs() {
        let bus = InMemoryBus::new();
        bus.add_stream(StreamConfig {
            name: "ORDERS".to_string(),
            subjects: vec!["orders.>".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
        bus.add_stream(StreamConfig {
            name: "ORDERS".to_string(),
            subjects: vec!["orders.events.>".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();

        let streams = bus.streams();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].subjects, vec!["orders.events.>".to_string()]);
    }
}
