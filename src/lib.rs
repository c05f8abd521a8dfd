//! # relayq
//!
//! A reliable task-queue worker runtime for Rust applications.
//!
//! ## Features
//!
//! - **At-least-once delivery**: every task is acknowledged exactly once,
//!   after its outcome is settled
//! - **Retries with backoff**: failed tasks take an exponential, jittered
//!   delay through a TTL-based retry queue
//! - **Dead-lettering**: exhausted or permanently failed tasks are parked
//!   with their error attached
//! - **Prefetch-bounded concurrency**: the broker window is the only
//!   throttle, no extra worker pools
//! - **Graceful shutdown**: in-flight tasks drain, resources are released
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use relayq::prelude::*;
//! use serde_json::{Value, json};
//!
//! struct EmailHandler;
//!
//! #[async_trait]
//! impl TaskHandler for EmailHandler {
//!     type Resources = ();
//!     type Output = Value;
//!
//!     fn worker_type(&self) -> &'static str {
//!         "email"
//!     }
//!
//!     async fn initialize(&self) -> Result<Self::Resources, TaskError> {
//!         Ok(())
//!     }
//!
//!     async fn execute(
//!         &self,
//!         task: &Task,
//!         _resources: &Self::Resources,
//!         ctx: &mut TaskContext,
//!     ) -> Result<Self::Output, TaskError> {
//!         ctx.log(LogLevel::Info, format!("delivering {}", task.id));
//!         Ok(json!({ "delivered": true }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RelayError> {
//!     let config = RelayConfig::development();
//!     relayq::logging::init(&config.logging);
//!
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let mut runtime = WorkerRuntime::new(config, broker, EmailHandler);
//!     runtime.start().await?;
//!
//!     let task = Task::new("email", serde_json::Map::new());
//!     runtime.queue().enqueue(&task).await?;
//!
//!     runtime.wait_for_shutdown().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod limit;
pub mod logging;
pub mod queue;
pub mod report;
pub mod retry;
pub mod runtime;
pub mod task;

pub mod prelude {
    pub use crate::config::{LoggingConfig, QueueConfig, RelayConfig};
    pub use crate::context::{LogLevel, TaskContext, TaskLog};
    pub use crate::error::{RelayError, RelayResult, TaskError};
    pub use crate::handler::TaskHandler;
    pub use crate::limit::Throttle;
    pub use crate::queue::{Broker, InMemoryBroker, QueueClient, SharedBroker, TaskDelivery};
    pub use crate::report::{LogReporter, NullReporter, ProgressReporter, ProgressUpdate};
    pub use crate::retry::RetryPolicy;
    pub use crate::runtime::WorkerRuntime;
    pub use crate::task::{Task, TaskId, TaskOutcome, TaskStatus};
    pub use async_trait::async_trait;
}

pub use crate::config::{LoggingConfig, QueueConfig, RelayConfig};
pub use crate::context::{LogLevel, TaskContext, TaskLog};
pub use crate::error::{RelayError, RelayResult, TaskError};
pub use crate::handler::TaskHandler;
pub use crate::limit::Throttle;
pub use crate::queue::{Broker, InMemoryBroker, QueueClient, SharedBroker, TaskDelivery};
pub use crate::report::{LogReporter, NullReporter, ProgressReporter, ProgressUpdate};
pub use crate::retry::RetryPolicy;
pub use crate::runtime::WorkerRuntime;
pub use crate::task::{Task, TaskId, TaskOutcome, TaskStatus};
pub use async_trait::async_trait;
