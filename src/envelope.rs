//! # Event Envelope
//!
//! The self-describing envelope wrapped around every event published through
//! the bus.
//!
//! ## Design Principles
//!
//! 1. **Fail fast, report first cause**: the builder records the first
//!    failure and every later step becomes a passthrough; only [`EventMessage::build`]
//!    surfaces the error.
//! 2. **Canonical JSON wire format**: the JSON projection is the
//!    cross-version contract. Field presence and null-vs-empty distinctions
//!    are preserved exactly.
//! 3. **Symmetry**: `parse_from_bytes(build(m)) == m` for every valid
//!    envelope.
//!
//! ## Wire Format
//!
//! ```json
//! {
//!   "NatsEvent": {
//!     "id": 111,
//!     "id_string": "",
//!     "user_id": 432,
//!     "tenant_id": 0,
//!     "time": "2026-08-05T09:12:45.123456789Z",
//!     "subject": ""
//!   },
//!   "body": "[\"test\"]",
//!   "old_body": "",
//!   "request": null,
//!   "error": null
//! }
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Errors recorded while building or parsing an envelope.
///
/// Validation failures are always local to the builder and are never
/// retried; they surface synchronously from [`EventMessage::build`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("event id is empty")]
    EmptyId,

    #[error("event user id is empty")]
    EmptyUserId,

    #[error("event time {0:?} is not valid RFC 3339")]
    InvalidTime(String),

    #[error("envelope has no event")]
    MissingEvent,

    #[error("failed to encode request payload: {0}")]
    EncodeRequest(String),

    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("failed to decode envelope: {0}")]
    Decode(String),

    /// An error slot carried over the wire in a parsed message.
    #[error("message carries an error: {0}")]
    Recorded(String),

    /// A later failure chained onto an earlier one. The display form reads
    /// newest-first, so a single log line reconstructs the failure path.
    #[error("{cause}: {prior}")]
    Chained {
        cause: Box<EnvelopeError>,
        prior: Box<EnvelopeError>,
    },
}

/// Chain `err` onto an already-recorded failure, if any.
pub(crate) fn chain(prior: Option<EnvelopeError>, err: EnvelopeError) -> EnvelopeError {
    match prior {
        Some(prior) => EnvelopeError::Chained {
            cause: Box::new(err),
            prior: Box::new(prior),
        },
        None => err,
    }
}

/// Identity and ownership metadata attached to an [`EventMessage`].
///
/// Exactly one identity form must be present: a positive `id` or a non-empty
/// `id_string`. `user_id` is required and non-zero; `tenant_id` zero means
/// "no tenant". `subject` is always empty when producing and is populated by
/// the delivery pipeline with the broker subject on the consuming side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatsEvent {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub id_string: String,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub tenant_id: i64,
    /// RFC 3339 with nanosecond precision; stamped at build time when empty
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub subject: String,
}

/// Behavior the delivery pipeline needs from a message payload.
///
/// Implemented by [`EventMessage`] and [`crate::AuditLogMessage`]; the
/// pipeline is generic over this capability set, not over concrete types.
pub trait MessagePayload: Send + Sync {
    /// Parse wire bytes into `self`, replacing any previous state. On
    /// failure the payload is left invalid for any subsequent use.
    fn parse_from_bytes(&mut self, data: &[u8]) -> Result<(), EnvelopeError>;

    /// Record the broker subject this payload was delivered on.
    ///
    /// # Panics
    ///
    /// May panic when called on a payload that was never successfully
    /// parsed or built; the pipeline only calls it after a successful
    /// [`MessagePayload::parse_from_bytes`].
    fn add_subject(&mut self, subject: &str);

    /// Canonical JSON projection, usable for logging and debugging.
    fn to_json(&self) -> Result<String, EnvelopeError>;

    /// Canonical JSON projection as bytes.
    fn to_json_bytes(&self) -> Result<Vec<u8>, EnvelopeError>;
}

/// The event envelope: one [`NatsEvent`] plus body, prior body, and an
/// optional embedded binary sub-payload.
///
/// Built through a consuming fluent chain:
///
/// ```rust
/// use jetstream_events::{EventMessage, NatsEvent};
///
/// let data = EventMessage::new()
///     .with_event(NatsEvent { id: 111, user_id: 432, ..Default::default() })
///     .with_body(&vec!["test"])
///     .build()
///     .unwrap();
/// assert!(!data.is_empty());
/// ```
///
/// Each step checks the sticky error first, so failures compose without the
/// call site branching after every step; [`EventMessage::build`] reports the
/// first cause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Event identity; `None` until [`EventMessage::with_event`] succeeds
    #[serde(rename = "NatsEvent")]
    pub event: Option<NatsEvent>,
    /// Serialized dump of the current state
    #[serde(default)]
    pub body: String,
    /// Serialized dump of the prior state, empty when not applicable
    #[serde(default)]
    pub old_body: String,
    /// Embedded binary sub-payload, independently encoded
    #[serde(default)]
    pub request: Option<Vec<u8>>,
    /// Wire error slot; always `null` on a validly built message
    #[serde(default)]
    pub error: Option<String>,
    #[serde(skip)]
    build_error: Option<EnvelopeError>,
}

impl EventMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the event descriptor after validating it.
    ///
    /// Fails when both `id <= 0` and `id_string` is empty, or when
    /// `user_id` is zero. An empty `time` is stamped with the current time
    /// in RFC 3339 nanosecond form; a non-empty `time` must already parse
    /// under that format. On failure `event` stays `None` and the error is
    /// recorded.
    pub fn with_event(mut self, mut event: NatsEvent) -> Self {
        if event.id <= 0 && event.id_string.is_empty() {
            return self.fail(EnvelopeError::EmptyId);
        }
        if event.user_id == 0 {
            return self.fail(EnvelopeError::EmptyUserId);
        }
        if event.time.is_empty() {
            event.time = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        } else if DateTime::parse_from_rfc3339(&event.time).is_err() {
            let time = std::mem::take(&mut event.time);
            return self.fail(EnvelopeError::InvalidTime(time));
        }
        if self.build_error.is_none() {
            self.event = Some(event);
        }
        self
    }

    /// Store a deterministic JSON dump of `body` as the current state.
    /// Passthrough when a prior step already failed.
    pub fn with_body<T: Serialize>(mut self, body: &T) -> Self {
        if self.build_error.is_some() {
            return self;
        }
        self.body = dump(body);
        self
    }

    /// Store a deterministic JSON dump of `body` as the prior state.
    /// Passthrough when a prior step already failed.
    pub fn with_old_body<T: Serialize>(mut self, body: &T) -> Self {
        if self.build_error.is_some() {
            return self;
        }
        self.old_body = dump(body);
        self
    }

    /// Encode `request` through the binary sub-payload codec and embed it.
    /// A codec failure is recorded and leaves `request` empty.
    pub fn with_request<T: Serialize>(mut self, request: &T) -> Self {
        match bincode::serialize(request) {
            Ok(bytes) => {
                if self.build_error.is_none() {
                    self.request = Some(bytes);
                }
                self
            }
            Err(err) => self.fail(EnvelopeError::EncodeRequest(err.to_string())),
        }
    }

    /// Finalize the envelope into wire bytes.
    ///
    /// Returns the recorded error when any earlier step failed, a
    /// missing-event error when [`EventMessage::with_event`] never
    /// succeeded, and otherwise the canonical JSON encoding with the error
    /// slot null.
    pub fn build(mut self) -> Result<Vec<u8>, EnvelopeError> {
        if let Some(err) = self.build_error.take() {
            return Err(err);
        }
        if self.event.is_none() {
            return Err(EnvelopeError::MissingEvent);
        }
        serde_json::to_vec(&self).map_err(|err| EnvelopeError::Encode(err.to_string()))
    }

    /// The error recorded by the builder chain, if any.
    pub fn build_error(&self) -> Option<&EnvelopeError> {
        self.build_error.as_ref()
    }

    /// Parse a JSON string into a fresh envelope.
    pub fn parse_json(input: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(input).map_err(|err| EnvelopeError::Decode(err.to_string()))
    }

    fn fail(mut self, err: EnvelopeError) -> Self {
        let err = chain(self.build_error.take(), err);
        self.error = Some(err.to_string());
        self.build_error = Some(err);
        self
    }
}

impl MessagePayload for EventMessage {
    fn parse_from_bytes(&mut self, data: &[u8]) -> Result<(), EnvelopeError> {
        match serde_json::from_slice::<EventMessage>(data) {
            Ok(parsed) => {
                *self = parsed;
                Ok(())
            }
            Err(err) => {
                let err = EnvelopeError::Decode(err.to_string());
                self.build_error = Some(chain(self.build_error.take(), err.clone()));
                Err(err)
            }
        }
    }

    fn add_subject(&mut self, subject: &str) {
        self.event
            .as_mut()
            .expect("add_subject called on an envelope without an event")
            .subject = subject.to_string();
    }

    fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|err| EnvelopeError::Encode(err.to_string()))
    }

    fn to_json_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|err| EnvelopeError::Encode(err.to_string()))
    }
}

/// Deterministic human-readable dump of an arbitrary serializable value.
/// Values that cannot be serialized dump as an empty string.
fn dump<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
