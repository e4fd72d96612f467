//! # Message Envelopes
//!
//! The field shapes carried on the wire for the primary stream and the
//! dead-letter stream. Both are flat string-keyed maps on the broker side
//! (Redis Streams fields are strings); these types are the typed view a
//! producer builds before flattening and a consumer parses after reading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Fields;

/// Envelope published to the primary task stream.
///
/// Field order: `task_id`, `name`, `payload`, `execution_key`,
/// `scheduled_at`, `attempt`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskEnvelope {
    pub task_id: i64,
    pub name: String,
    /// JSON-encoded payload (kept as a string, mirroring how it is stored
    /// as a stream field).
    pub payload: String,
    pub execution_key: String,
    pub scheduled_at: DateTime<Utc>,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl TaskEnvelope {
    /// Flatten into the field list a `Broker::publish` call expects.
    pub fn to_fields(&self) -> Fields {
        vec![
            ("task_id".to_string(), self.task_id.to_string()),
            ("name".to_string(), self.name.clone()),
            ("payload".to_string(), self.payload.clone()),
            ("execution_key".to_string(), self.execution_key.clone()),
            ("scheduled_at".to_string(), self.scheduled_at.to_rfc3339()),
            ("attempt".to_string(), self.attempt.to_string()),
        ]
    }

    /// Parse back out of broker fields. Missing or malformed fields are
    /// reported individually so the caller can decide whether the message
    /// is salvageable: a decode failure is an immediate ack + drop, not a
    /// retry.
    pub fn from_fields(fields: &Fields) -> Result<Self, EnvelopeDecodeError> {
        let get = |key: &str| {
            fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        let task_id = get("task_id")
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or(EnvelopeDecodeError::MissingField("task_id"))?;
        let name = get("name")
            .map(|v| v.to_string())
            .ok_or(EnvelopeDecodeError::MissingField("name"))?;
        let payload = get("payload").unwrap_or("{}").to_string();
        let execution_key = get("execution_key")
            .map(|v| v.to_string())
            .ok_or(EnvelopeDecodeError::MissingField("execution_key"))?;
        let scheduled_at = get("scheduled_at")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.with_timezone(&Utc))
            .ok_or(EnvelopeDecodeError::MissingField("scheduled_at"))?;
        let attempt = get("attempt")
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or(EnvelopeDecodeError::MissingField("attempt"))?;

        Ok(Self {
            task_id,
            name,
            payload,
            execution_key,
            scheduled_at,
            attempt,
        })
    }
}

/// Envelope published to the dead-letter stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DlqEnvelope {
    pub task_id: i64,
    pub execution_key: String,
    pub name: String,
    /// Frozen JSON-encoded payload as it stood at the time of the final
    /// failure.
    pub payload: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DlqEnvelope {
    pub fn to_fields(&self) -> Fields {
        vec![
            ("task_id".to_string(), self.task_id.to_string()),
            ("execution_key".to_string(), self.execution_key.clone()),
            ("name".to_string(), self.name.clone()),
            ("payload".to_string(), self.payload.clone()),
            ("error".to_string(), self.error.clone()),
            ("failed_at".to_string(), self.failed_at.to_rfc3339()),
        ]
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeDecodeError {
    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_fields() {
        let envelope = TaskEnvelope {
            task_id: 42,
            name: "echo".to_string(),
            payload: r#"{"msg":"hi"}"#.to_string(),
            execution_key: "echo:abc:0".to_string(),
            scheduled_at: Utc::now(),
            attempt: 1,
        };

        let fields = envelope.to_fields();
        let decoded = TaskEnvelope::from_fields(&fields).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn decode_fails_on_missing_task_id() {
        let fields = vec![("name".to_string(), "echo".to_string())];
        let err = TaskEnvelope::from_fields(&fields).unwrap_err();
        assert_eq!(err, EnvelopeDecodeError::MissingField("task_id"));
    }

    #[test]
    fn decode_defaults_missing_payload_to_empty_object() {
        let envelope = TaskEnvelope {
            task_id: 1,
            name: "echo".to_string(),
            payload: "{}".to_string(),
            execution_key: "echo:abc:0".to_string(),
            scheduled_at: Utc::now(),
            attempt: 1,
        };
        let mut fields = envelope.to_fields();
        fields.retain(|(k, _)| k != "payload");
        let decoded = TaskEnvelope::from_fields(&fields).unwrap();
        assert_eq!(decoded.payload, "{}");
    }
}
