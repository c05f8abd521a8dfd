//! Per-invocation task context: step tracking and captured logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Severity of a captured log line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One captured log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    /// When the line was recorded
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Message text
    pub message: String,
}

/// Working state handed mutably to the handler for one delivery.
///
/// A fresh context is built per attempt; nothing carries over between
/// retries except what rides in the task envelope itself. Captured logs are
/// attached to the terminal progress report so a task's story survives the
/// worker process.
#[derive(Debug)]
pub struct TaskContext {
    /// Id of the task being worked on
    pub task_id: String,
    /// 1-based attempt number (`retry_count + 1`)
    pub attempt: u32,
    /// When this attempt started
    pub started_at: DateTime<Utc>,
    current_step: String,
    logs: Vec<TaskLog>,
}

impl TaskContext {
    /// Build a context for one delivery of `task`, starting at
    /// `initial_step`.
    pub fn new(task: &Task, initial_step: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            attempt: task.retry_count + 1,
            started_at: Utc::now(),
            current_step: initial_step.into(),
            logs: Vec::new(),
        }
    }

    /// Record a log line and mirror it to the process logger.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(task_id = %self.task_id, "{message}"),
            LogLevel::Info => tracing::info!(task_id = %self.task_id, "{message}"),
            LogLevel::Warn => tracing::warn!(task_id = %self.task_id, "{message}"),
            LogLevel::Error => tracing::error!(task_id = %self.task_id, "{message}"),
        }
        self.logs.push(TaskLog {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    /// Move the step tracker to a new pipeline position.
    pub fn set_step(&mut self, step: impl Into<String>) {
        self.current_step = step.into();
    }

    /// Current pipeline position.
    pub fn current_step(&self) -> &str {
        &self.current_step
    }

    /// Everything logged so far, in order.
    pub fn logs(&self) -> &[TaskLog] {
        &self.logs
    }

    /// Consume the context, keeping only the captured logs.
    pub fn into_logs(self) -> Vec<TaskLog> {
        self.logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn task_with_retries(retry_count: u32) -> Task {
        let mut task = Task::new("demo", Map::new());
        task.retry_count = retry_count;
        task
    }

    #[test]
    fn attempt_is_retry_count_plus_one() {
        let ctx = TaskContext::new(&task_with_retries(0), "start");
        assert_eq!(ctx.attempt, 1);
        let ctx = TaskContext::new(&task_with_retries(4), "start");
        assert_eq!(ctx.attempt, 5);
    }

    #[test]
    fn logs_append_in_order() {
        let mut ctx = TaskContext::new(&task_with_retries(0), "start");
        ctx.log(LogLevel::Info, "first");
        ctx.log(LogLevel::Warn, "second");
        ctx.log(LogLevel::Error, "third");
        let messages: Vec<_> = ctx.logs().iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, ["first", "second", "third"]);
        assert_eq!(ctx.logs()[1].level, LogLevel::Warn);
    }

    #[test]
    fn step_tracker_starts_seeded_and_moves() {
        let mut ctx = TaskContext::new(&task_with_retries(0), "validate");
        assert_eq!(ctx.current_step(), "validate");
        ctx.set_step("deliver");
        assert_eq!(ctx.current_step(), "deliver");
    }

    #[test]
    fn log_level_serializes_lowercase() {
        let json = serde_json::to_string(&LogLevel::Warn).unwrap();
        assert_eq!(json, "\"warn\"");
    }

    #[test]
    fn into_logs_hands_back_the_buffer() {
        let mut ctx = TaskContext::new(&task_with_retries(1), "start");
        ctx.log(LogLevel::Debug, "only line");
        let logs = ctx.into_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "only line");
    }
}
