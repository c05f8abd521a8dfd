//! The task handler contract.
//!
//! A handler is the domain half of a worker: it knows how to set up its
//! resources, execute one task, and tell a permanent failure from a
//! transient one. The runtime owns everything else (consumption, retries,
//! dead-lettering, shutdown ordering).

use async_trait::async_trait;
use serde::Serialize;

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::task::Task;

/// Domain logic plugged into a [`WorkerRuntime`](crate::runtime::WorkerRuntime).
///
/// Handlers are injected at construction time, not subclassed. Resources
/// (SMTP transport, HTTP client, DB pool) are an explicit value: produced
/// once by [`initialize`](Self::initialize), shared by reference across
/// concurrent [`execute`](Self::execute) calls, and released by
/// [`shutdown`](Self::shutdown).
///
/// ```no_run
/// use async_trait::async_trait;
/// use relayq::prelude::*;
///
/// struct Echo;
///
/// #[async_trait]
/// impl TaskHandler for Echo {
///     type Resources = ();
///     type Output = String;
///
///     fn worker_type(&self) -> &'static str {
///         "echo"
///     }
///
///     async fn initialize(&self) -> Result<(), TaskError> {
///         Ok(())
///     }
///
///     async fn execute(
///         &self,
///         task: &Task,
///         _resources: &(),
///         ctx: &mut TaskContext,
///     ) -> Result<String, TaskError> {
///         ctx.log(LogLevel::Info, "echoing");
///         Ok(task.task_type.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Handler-owned resources built during startup and shared across
    /// concurrent executions.
    type Resources: Send + Sync + 'static;

    /// Success value, serialized into the completed progress report.
    type Output: Serialize + Send + Sync;

    /// Stable identifier for this worker, used in logs and reports.
    fn worker_type(&self) -> &'static str;

    /// Build and verify resources before any task is consumed.
    ///
    /// An error here aborts startup: a worker with broken resources must
    /// not take deliveries off the queue.
    async fn initialize(&self) -> Result<Self::Resources, TaskError>;

    /// First step recorded in the task context, before `execute` runs.
    ///
    /// Override to route on a task field (the default is `"processing"`).
    fn initial_step(&self, task: &Task) -> String {
        let _ = task;
        "processing".to_string()
    }

    /// Do the work for one task.
    async fn execute(
        &self,
        task: &Task,
        resources: &Self::Resources,
        ctx: &mut TaskContext,
    ) -> Result<Self::Output, TaskError>;

    /// Whether `error` is beyond retrying for `task`.
    ///
    /// The default trusts the error's own permanence flag. Override to add
    /// domain knowledge (SMTP reply codes, HTTP statuses). A `true` here
    /// sends the task straight to the dead-letter queue.
    fn is_permanent_error(&self, error: &TaskError, task: &Task) -> bool {
        let _ = task;
        error.is_permanent()
    }

    /// Release resources during graceful shutdown.
    ///
    /// Errors are logged by the runtime and never abort the shutdown.
    async fn shutdown(&self, resources: &Self::Resources) -> Result<(), TaskError> {
        let _ = resources;
        Ok(())
    }
}
