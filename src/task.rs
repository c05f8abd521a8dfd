//! Task envelope and lifecycle types.
//!
//! The wire format is JSON with camelCase keys. An inbound envelope carries
//! `id`, `type` and `retryCount` (absent means 0); every other field belongs
//! to the domain payload and is preserved verbatim through retry and
//! dead-letter copies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;

/// Unique identifier for a task
pub type TaskId = String;

/// Status of a task as seen by progress consumers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting in the main queue
    Pending,
    /// Picked up by a worker, handler running
    Processing,
    /// Handler succeeded, delivery acknowledged
    Completed,
    /// Transient failure, a retry copy is waiting out its delay
    RetryScheduled,
    /// Permanent failure, task sent to the dead-letter queue
    Failed,
}

/// A task as it travels through the broker.
///
/// Domain fields ride in `payload` via `serde(flatten)`, so an envelope like
/// `{"id":"a1","type":"send_email","retryCount":2,"to":"x@y"}` keeps `to`
/// addressable by handlers and survives a retry round-trip unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Type identifier for the task
    #[serde(rename = "type")]
    pub task_type: String,
    /// Delivery attempts already consumed by this message
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
    /// Domain payload: every envelope field not listed above
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Task {
    /// Create a fresh task with a random UUID v4 id and zero retries.
    pub fn new(task_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            retry_count: 0,
            payload,
        }
    }

    /// Deserialize the domain payload into a concrete type.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, TaskError> {
        let value = Value::Object(self.payload.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Build the copy published to the retry queue: same envelope with
    /// `retryCount` bumped and `retryScheduled` stamped.
    pub fn retry_envelope(&self, scheduled_at: DateTime<Utc>) -> Value {
        let mut envelope = self.to_wire();
        envelope.insert(
            "retryCount".to_string(),
            Value::from(self.retry_count + 1),
        );
        envelope.insert(
            "retryScheduled".to_string(),
            Value::from(scheduled_at.to_rfc3339()),
        );
        Value::Object(envelope)
    }

    /// Build the copy published to the dead-letter queue: same envelope plus
    /// the failure message and a `sentToDLQ` stamp.
    pub fn dead_letter_envelope(&self, error: &str, sent_at: DateTime<Utc>) -> Value {
        let mut envelope = self.to_wire();
        envelope.insert("error".to_string(), Value::from(error));
        envelope.insert("sentToDLQ".to_string(), Value::from(sent_at.to_rfc3339()));
        Value::Object(envelope)
    }

    fn to_wire(&self) -> Map<String, Value> {
        let mut envelope = self.payload.clone();
        envelope.insert("id".to_string(), Value::from(self.id.clone()));
        envelope.insert("type".to_string(), Value::from(self.task_type.clone()));
        envelope.insert("retryCount".to_string(), Value::from(self.retry_count));
        envelope
    }
}

/// Outcome of one delivery, decided after the handler returns.
///
/// The runtime maps each variant to exactly one terminal broker action:
/// acknowledge, schedule a retry copy, or dead-letter.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Handler succeeded with this serialized output
    Success(Value),
    /// Handler failed, retry budget and classification allow another attempt
    TransientFailure(TaskError),
    /// Handler failed and no retry will be attempted
    PermanentFailure(TaskError),
}
