//! Audit log envelope: a flat, append-only record of who changed what.
//!
//! Unlike [`EventMessage`](crate::EventMessage) there is no validation
//! chain; any fully populated record is buildable. The JSON wire shape
//! omits `old_data`/`new_data` when they are empty.

use crate::envelope::{EnvelopeError, MessagePayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One audited change, serialized as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditLogMessage {
    /// Broker subject, populated by the pipeline on the consuming side
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub user_id: i64,
    /// Kind of record that changed (e.g. "user")
    #[serde(default)]
    pub auditable_type: String,
    #[serde(default)]
    pub auditable_id: String,
    /// Performed action (e.g. "update")
    #[serde(default)]
    pub action: String,
    /// Serialized field-level diff
    #[serde(default)]
    pub audited_changes: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub old_data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub new_data: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    /// Wire error slot; `null` unless a failure was recorded
    #[serde(default)]
    pub error: Option<String>,
}

impl AuditLogMessage {
    /// Serialize the record into wire bytes.
    ///
    /// Fails only when an error was recorded on the record or the codec
    /// itself fails.
    pub fn build(&self) -> Result<Vec<u8>, EnvelopeError> {
        if let Some(err) = &self.error {
            return Err(EnvelopeError::Recorded(err.clone()));
        }
        serde_json::to_vec(self).map_err(|err| EnvelopeError::Encode(err.to_string()))
    }

    /// Parse a JSON string into a fresh record.
    pub fn parse_json(input: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(input).map_err(|err| EnvelopeError::Decode(err.to_string()))
    }
}

impl MessagePayload for AuditLogMessage {
    fn parse_from_bytes(&mut self, data: &[u8]) -> Result<(), EnvelopeError> {
        match serde_json::from_slice::<AuditLogMessage>(data) {
            Ok(parsed) => {
                *self = parsed;
                Ok(())
            }
            Err(err) => {
                let err = EnvelopeError::Decode(err.to_string());
                self.error = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn add_subject(&mut self, subject: &str) {
        self.subject = subject.to_string();
    }

    fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|err| EnvelopeError::Encode(err.to_string()))
    }

    fn to_json_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|err| EnvelopeError::Encode(err.to_string()))
    }
}
