//! Error types for RelayQ operations.
//!
//! Two tiers: [`RelayError`] for infrastructure failures (broker, config,
//! lifecycle) and [`TaskError`] for failures a handler reports while working
//! on a task. Only the latter participates in retry classification.

use thiserror::Error;

/// Result type used throughout RelayQ.
pub type RelayResult<T> = Result<T, RelayError>;

/// Main error type for RelayQ operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Broker/queue operation error
    #[error("Queue error: {message}")]
    Queue {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Handler initialization failed during startup
    #[error("Handler initialization failed: {message}")]
    Initialization {
        /// Error message
        message: String,
        /// The handler's failure
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The worker runtime is already running
    #[error("Worker runtime is already running")]
    AlreadyRunning,

    /// The worker runtime is not running
    #[error("Worker runtime is not running")]
    NotRunning,
}

impl RelayError {
    /// Create a queue error without an underlying cause
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
            source: None,
        }
    }

    /// Create a queue error wrapping an underlying cause
    pub fn queue_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Queue {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Wrap a handler failure that aborted startup
    pub fn initialization(source: TaskError) -> Self {
        Self::Initialization {
            message: source.message().to_string(),
            source: Some(Box::new(source)),
        }
    }
}

/// Failure reported by a [`TaskHandler`](crate::handler::TaskHandler) while
/// working on a task.
///
/// The `permanent` flag is the handler's own verdict: a permanently failed
/// task goes straight to the dead-letter queue, skipping the retry budget.
/// Transient failures are retried until the budget runs out or the message
/// text matches a non-retryable pattern.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct TaskError {
    message: String,
    permanent: bool,
    code: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TaskError {
    /// A failure worth retrying (network hiccup, busy upstream, timeout).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
            code: None,
            source: None,
        }
    }

    /// A failure that will not succeed on retry (bad input, rejected request).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
            code: None,
            source: None,
        }
    }

    /// Attach a machine-readable code (SMTP reply code, HTTP status, ...).
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach the underlying error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// The human-readable failure message, as used for classification and
    /// for the `error` field of dead-letter envelopes.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the handler marked this failure as permanent.
    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    /// The attached code, if any.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            message: format!("Serialization error: {err}"),
            permanent: false,
            code: None,
            source: Some(Box::new(err)),
        }
    }
}
