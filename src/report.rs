//! Progress reporting at task state transitions.
//!
//! The runtime emits one update per transition (processing, completed,
//! retry scheduled, failed). Reporting is fire-and-forget by contract:
//! implementations swallow their own transport failures, so a broken
//! dashboard can never take task processing down with it. Implementations
//! must not panic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::context::TaskLog;
use crate::task::TaskStatus;

/// One progress update, serialized with camelCase keys for external
/// consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// New task status
    pub status: TaskStatus,
    /// Percent complete, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Pipeline position from the task context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Retries consumed by the message being processed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Failure message, on error transitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the next attempt becomes eligible
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<DateTime<Utc>>,
    /// Serialized handler output, on completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Completion timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Permanent-failure timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Logs captured during the attempt, attached to terminal updates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<TaskLog>>,
}

impl ProgressUpdate {
    fn bare(status: TaskStatus) -> Self {
        Self {
            status,
            progress: None,
            current_step: None,
            retry_count: None,
            error_message: None,
            next_retry: None,
            result: None,
            completed_at: None,
            failed_at: None,
            logs: None,
        }
    }

    /// Work on the task has started.
    pub fn processing(current_step: impl Into<String>, retry_count: u32) -> Self {
        Self {
            progress: Some(0),
            current_step: Some(current_step.into()),
            retry_count: Some(retry_count),
            ..Self::bare(TaskStatus::Processing)
        }
    }

    /// The handler succeeded.
    pub fn completed(result: Value, logs: Vec<TaskLog>) -> Self {
        Self {
            progress: Some(100),
            result: Some(result),
            completed_at: Some(Utc::now()),
            logs: Some(logs),
            ..Self::bare(TaskStatus::Completed)
        }
    }

    /// A retry copy has been scheduled.
    pub fn retry_scheduled(
        error_message: impl Into<String>,
        next_retry: DateTime<Utc>,
        retry_count: u32,
        logs: Vec<TaskLog>,
    ) -> Self {
        Self {
            error_message: Some(error_message.into()),
            next_retry: Some(next_retry),
            retry_count: Some(retry_count),
            logs: Some(logs),
            ..Self::bare(TaskStatus::RetryScheduled)
        }
    }

    /// The task failed permanently and was dead-lettered.
    pub fn failed(error_message: impl Into<String>, logs: Vec<TaskLog>) -> Self {
        Self {
            error_message: Some(error_message.into()),
            failed_at: Some(Utc::now()),
            logs: Some(logs),
            ..Self::bare(TaskStatus::Failed)
        }
    }
}

/// Sink for progress updates.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Deliver one update. Infallible by contract: swallow transport
    /// errors after logging them.
    async fn report(&self, task_id: &str, update: ProgressUpdate);
}

/// Reporter that forwards every update to the process logger.
#[derive(Debug, Default)]
pub struct LogReporter;

#[async_trait]
impl ProgressReporter for LogReporter {
    async fn report(&self, task_id: &str, update: ProgressUpdate) {
        tracing::debug!(
            task_id = %task_id,
            status = ?update.status,
            step = update.current_step.as_deref().unwrap_or(""),
            error = update.error_message.as_deref().unwrap_or(""),
            "task progress"
        );
    }
}

/// Reporter that drops every update.
#[derive(Debug, Default)]
pub struct NullReporter;

#[async_trait]
impl ProgressReporter for NullReporter {
    async fn report(&self, _task_id: &str, _update: ProgressUpdate) {}
}
