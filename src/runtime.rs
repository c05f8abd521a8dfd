//! The worker runtime: consumption loop, per-task state machine, shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::{JoinError, JoinSet};

use crate::config::RelayConfig;
use crate::context::TaskContext;
use crate::error::{RelayError, RelayResult};
use crate::handler::TaskHandler;
use crate::queue::{QueueClient, SharedBroker, TaskDelivery};
use crate::report::{LogReporter, ProgressReporter, ProgressUpdate};
use crate::retry::RetryPolicy;
use crate::task::TaskOutcome;

/// Everything a spawned per-delivery task needs.
struct RunState<H: TaskHandler> {
    queue: QueueClient,
    handler: Arc<H>,
    resources: Arc<H::Resources>,
    policy: RetryPolicy,
    reporter: Arc<dyn ProgressReporter>,
}

/// A broker-fed worker: consumes the main queue, runs the injected
/// [`TaskHandler`], and settles every delivery with exactly one of
/// acknowledge, retry or dead-letter.
///
/// Composition happens at construction; there is nothing to subclass.
/// Concurrency is whatever the broker prefetch allows: each delivery runs
/// on its own tokio task and the broker stops handing out deliveries once
/// `prefetch` of them are unacknowledged.
pub struct WorkerRuntime<H: TaskHandler> {
    config: RelayConfig,
    queue: QueueClient,
    handler: Arc<H>,
    reporter: Arc<dyn ProgressReporter>,
    is_running: Arc<AtomicBool>,
    is_shutting_down: Arc<AtomicBool>,
    shutdown_signal: Arc<Notify>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    resources: Mutex<Option<Arc<H::Resources>>>,
}

impl<H: TaskHandler> WorkerRuntime<H> {
    /// Compose a runtime from config, a broker and a handler.
    ///
    /// Progress goes to a [`LogReporter`] unless
    /// [`with_reporter`](Self::with_reporter) swaps it out.
    pub fn new(config: RelayConfig, broker: SharedBroker, handler: H) -> Self {
        let queue = QueueClient::new(broker, config.queue.clone());
        Self {
            config,
            queue,
            handler: Arc::new(handler),
            reporter: Arc::new(LogReporter),
            is_running: Arc::new(AtomicBool::new(false)),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown_signal: Arc::new(Notify::new()),
            supervisor: Mutex::new(None),
            resources: Mutex::new(None),
        }
    }

    /// Replace the progress reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// The queue client this runtime consumes through.
    pub fn queue(&self) -> &QueueClient {
        &self.queue
    }

    /// Whether the runtime is currently consuming.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Initialize the handler, set up the topology and start consuming.
    ///
    /// Initialization failures abort the start: a worker with broken
    /// resources must not take deliveries off the queue.
    pub async fn start(&mut self) -> RelayResult<()> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }
        tracing::info!(worker_type = self.handler.worker_type(), "starting worker");

        let resources = self
            .handler
            .initialize()
            .await
            .map_err(RelayError::initialization)?;
        let resources = Arc::new(resources);

        self.queue.setup().await?;
        let deliveries = self.queue.consume().await?;

        let state = Arc::new(RunState {
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            resources: Arc::clone(&resources),
            policy: self.config.retry.clone(),
            reporter: Arc::clone(&self.reporter),
        });
        let shutdown = Arc::clone(&self.shutdown_signal);
        let handle = tokio::spawn(supervise(state, deliveries, shutdown));

        *self.resources.lock().await = Some(resources);
        *self.supervisor.lock().await = Some(handle);
        self.is_running.store(true, Ordering::SeqCst);
        tracing::info!(
            worker_type = self.handler.worker_type(),
            queue = %self.config.queue.main_queue,
            prefetch = self.config.queue.prefetch,
            "worker started"
        );
        Ok(())
    }

    /// Stop taking new deliveries, drain in-flight tasks, release handler
    /// resources and close the broker connection.
    ///
    /// Handler cleanup errors are logged, never propagated. In-flight tasks
    /// get no hard deadline here; callers wanting one can wrap this in
    /// `tokio::time::timeout`.
    pub async fn shutdown(&self) -> RelayResult<()> {
        if !self.is_running.load(Ordering::SeqCst)
            || self.is_shutting_down.swap(true, Ordering::SeqCst)
        {
            return Err(RelayError::NotRunning);
        }
        tracing::info!(worker_type = self.handler.worker_type(), "shutting down");
        self.shutdown_signal.notify_one();

        let supervisor = self.supervisor.lock().await.take();
        if let Some(handle) = supervisor {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "supervisor task failed");
            }
        }

        let resources = self.resources.lock().await.take();
        if let Some(resources) = resources {
            if let Err(err) = self.handler.shutdown(&resources).await {
                tracing::warn!(error = %err, "handler shutdown reported an error");
            }
        }

        let closed = self.queue.close().await;
        self.is_running.store(false, Ordering::SeqCst);
        self.is_shutting_down.store(false, Ordering::SeqCst);
        tracing::info!(worker_type = self.handler.worker_type(), "worker stopped");
        closed
    }

    /// Block until Ctrl-C arrives.
    pub async fn wait_for_shutdown(&self) -> RelayResult<()> {
        tokio::signal::ctrl_c()
            .await
            .map_err(|err| RelayError::queue_with_source("failed to listen for shutdown", err))?;
        tracing::info!("shutdown signal received");
        Ok(())
    }
}

impl<H: TaskHandler> Drop for WorkerRuntime<H> {
    fn drop(&mut self) {
        if self.is_running.load(Ordering::SeqCst) {
            tracing::warn!("worker runtime dropped while running, call shutdown() for a clean stop");
        }
    }
}

/// Feed deliveries into per-task tokio tasks until shutdown, then drain.
async fn supervise<H: TaskHandler>(
    state: Arc<RunState<H>>,
    mut deliveries: mpsc::Receiver<TaskDelivery>,
    shutdown: Arc<Notify>,
) {
    let mut inflight: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            maybe = deliveries.recv() => match maybe {
                Some(delivery) => {
                    let state = Arc::clone(&state);
                    inflight.spawn(process_delivery(state, delivery));
                }
                None => break,
            },
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                log_joined(joined);
            }
        }
    }
    // intake is done; let what already started finish
    drop(deliveries);
    while let Some(joined) = inflight.join_next().await {
        log_joined(joined);
    }
}

fn log_joined(result: Result<(), JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            tracing::error!(error = %err, "task processing panicked, delivery left for redelivery");
        }
    }
}

/// Run one delivery through the state machine and settle it.
async fn process_delivery<H: TaskHandler>(state: Arc<RunState<H>>, delivery: TaskDelivery) {
    let task_id = delivery.task.id.clone();
    let retry_count = delivery.task.retry_count;
    let mut context = TaskContext::new(
        &delivery.task,
        state.handler.initial_step(&delivery.task),
    );

    state
        .reporter
        .report(
            &task_id,
            ProgressUpdate::processing(context.current_step(), retry_count),
        )
        .await;
    tracing::info!(
        task_id = %task_id,
        task_type = %delivery.task.task_type,
        attempt = context.attempt,
        "processing task"
    );

    let outcome = match state
        .handler
        .execute(&delivery.task, &state.resources, &mut context)
        .await
    {
        Ok(output) => match serde_json::to_value(output) {
            Ok(value) => TaskOutcome::Success(value),
            Err(err) => {
                tracing::warn!(task_id = %task_id, error = %err, "task output not serializable");
                TaskOutcome::Success(serde_json::Value::Null)
            }
        },
        Err(err) => {
            if state.handler.is_permanent_error(&err, &delivery.task)
                || !state.policy.should_retry(&err, retry_count)
            {
                TaskOutcome::PermanentFailure(err)
            } else {
                TaskOutcome::TransientFailure(err)
            }
        }
    };

    match outcome {
        TaskOutcome::Success(value) => {
            tracing::info!(task_id = %task_id, attempt = context.attempt, "task completed");
            state
                .reporter
                .report(&task_id, ProgressUpdate::completed(value, context.into_logs()))
                .await;
            if let Err(err) = state.queue.ack(delivery).await {
                tracing::error!(task_id = %task_id, error = %err, "failed to ack completed task");
            }
        }
        TaskOutcome::TransientFailure(err) => {
            let delay = state.policy.retry_delay(retry_count);
            let next_retry = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            tracing::warn!(
                task_id = %task_id,
                error = %err,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                "task failed, scheduling retry"
            );
            state
                .reporter
                .report(
                    &task_id,
                    ProgressUpdate::retry_scheduled(
                        err.message(),
                        next_retry,
                        retry_count,
                        context.into_logs(),
                    ),
                )
                .await;
            if let Err(err) = state.queue.schedule_retry(delivery, delay).await {
                tracing::error!(task_id = %task_id, error = %err, "failed to schedule retry");
            }
        }
        TaskOutcome::PermanentFailure(err) => {
            tracing::error!(
                task_id = %task_id,
                error = %err,
                retry_count,
                "task failed permanently, dead-lettering"
            );
            state
                .reporter
                .report(
                    &task_id,
                    ProgressUpdate::failed(err.message(), context.into_logs()),
                )
                .await;
            if let Err(err) = state
                .queue
                .send_to_dead_letter(delivery, err.message())
                .await
            {
                tracing::error!(task_id = %task_id, error = %err, "failed to dead-letter task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LogLevel;
    use crate::error::TaskError;
    use crate::queue::InMemoryBroker;
    use crate::task::{Task, TaskStatus};
    use async_trait::async_trait;
    use serde_json::{Map, Value, json};
    use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
    use std::time::Duration;

    #[derive(Default)]
    struct TestHandler {
        executions: Arc<AtomicU32>,
        fail_attempts: u32,
        panic_attempts: u32,
        error_message: String,
        error_permanent: bool,
        error_code: Option<String>,
        treat_code_550_permanent: bool,
        init_fails: bool,
        shutdown_fails: bool,
        shutdown_called: Arc<AtomicBool>,
        gate: Option<Arc<AtomicBool>>,
        concurrent: Arc<AtomicU32>,
        max_concurrent: Arc<AtomicU32>,
        log_lines: bool,
    }

    #[async_trait]
    impl TaskHandler for TestHandler {
        type Resources = ();
        type Output = Value;

        fn worker_type(&self) -> &'static str {
            "test"
        }

        async fn initialize(&self) -> Result<(), TaskError> {
            if self.init_fails {
                return Err(TaskError::transient("resource verification failed"));
            }
            Ok(())
        }

        fn initial_step(&self, _task: &Task) -> String {
            "working".to_string()
        }

        async fn execute(
            &self,
            _task: &Task,
            _resources: &(),
            ctx: &mut TaskContext,
        ) -> Result<Value, TaskError> {
            let n = self.executions.fetch_add(1, SeqCst);
            let current = self.concurrent.fetch_add(1, SeqCst) + 1;
            self.max_concurrent.fetch_max(current, SeqCst);
            if let Some(gate) = &self.gate {
                while !gate.load(SeqCst) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            if self.log_lines {
                ctx.log(LogLevel::Info, format!("attempt {}", ctx.attempt));
            }
            let result = if n < self.panic_attempts {
                self.concurrent.fetch_sub(1, SeqCst);
                panic!("handler exploded");
            } else if n < self.fail_attempts {
                let mut err = if self.error_permanent {
                    TaskError::permanent(&self.error_message)
                } else {
                    TaskError::transient(&self.error_message)
                };
                if let Some(code) = &self.error_code {
                    err = err.with_code(code.clone());
                }
                Err(err)
            } else {
                Ok(json!({ "attempt": n + 1 }))
            };
            self.concurrent.fetch_sub(1, SeqCst);
            result
        }

        fn is_permanent_error(&self, error: &TaskError, _task: &Task) -> bool {
            if self.treat_code_550_permanent && error.code() == Some("550") {
                return true;
            }
            error.is_permanent()
        }

        async fn shutdown(&self, _resources: &()) -> Result<(), TaskError> {
            self.shutdown_called.store(true, SeqCst);
            if self.shutdown_fails {
                return Err(TaskError::transient("cleanup hiccup"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        updates: std::sync::Mutex<Vec<(String, ProgressUpdate)>>,
    }

    impl RecordingReporter {
        fn statuses(&self) -> Vec<TaskStatus> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .map(|(_, update)| update.status)
                .collect()
        }

        fn updates(&self) -> Vec<ProgressUpdate> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .map(|(_, update)| update.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ProgressReporter for RecordingReporter {
        async fn report(&self, task_id: &str, update: ProgressUpdate) {
            self.updates
                .lock()
                .unwrap()
                .push((task_id.to_string(), update));
        }
    }

    fn test_config(prefetch: u16, retry: RetryPolicy) -> RelayConfig {
        let mut config = RelayConfig::testing();
        config.queue.prefetch = prefetch;
        config.retry = retry;
        config
    }

    fn spec_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..5000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn task_with(payload: &[(&str, Value)]) -> Task {
        let mut map = Map::new();
        for (key, value) in payload {
            map.insert(key.to_string(), value.clone());
        }
        Task::new("test", map)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_task_is_acked_and_reported() {
        let reporter = Arc::new(RecordingReporter::default());
        let handler = TestHandler {
            log_lines: true,
            ..Default::default()
        };
        let executions = Arc::clone(&handler.executions);
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime = WorkerRuntime::new(test_config(1, spec_policy()), broker.clone(), handler)
            .with_reporter(reporter.clone());

        runtime.start().await.unwrap();
        runtime.queue().enqueue(&task_with(&[])).await.unwrap();

        let b = broker.clone();
        eventually(move || b.stats().acked == 1).await;
        assert_eq!(executions.load(SeqCst), 1);
        assert_eq!(broker.published("tasks_retry"), 0);
        assert_eq!(broker.published("tasks_dlq"), 0);

        assert_eq!(
            reporter.statuses(),
            vec![TaskStatus::Processing, TaskStatus::Completed]
        );
        let updates = reporter.updates();
        assert_eq!(updates[0].progress, Some(0));
        assert_eq!(updates[0].current_step.as_deref(), Some("working"));
        assert_eq!(updates[1].progress, Some(100));
        assert_eq!(updates[1].result, Some(json!({ "attempt": 1 })));
        assert_eq!(updates[1].logs.as_ref().unwrap().len(), 1);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_walk_the_backoff_ladder_to_success() {
        let reporter = Arc::new(RecordingReporter::default());
        let handler = TestHandler {
            fail_attempts: 3,
            error_message: "connection reset".to_string(),
            ..Default::default()
        };
        let executions = Arc::clone(&handler.executions);
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime = WorkerRuntime::new(test_config(1, spec_policy()), broker.clone(), handler)
            .with_reporter(reporter.clone());

        runtime.start().await.unwrap();
        runtime.queue().enqueue(&task_with(&[])).await.unwrap();

        let b = broker.clone();
        eventually(move || b.stats().acked == 4).await;
        assert_eq!(executions.load(SeqCst), 4, "three retries then success");
        assert_eq!(broker.published("tasks_dlq"), 0);

        let retries = broker.published_messages("tasks_retry");
        assert_eq!(retries.len(), 3);
        for (generation, nominal_ms) in [(0u64, 1000u64), (1, 2000), (2, 4000)] {
            let ttl = retries[generation as usize].expiration.unwrap();
            let nominal = Duration::from_millis(nominal_ms);
            assert!(ttl >= nominal, "generation {generation}: {ttl:?} < {nominal:?}");
            assert!(
                ttl < nominal + Duration::from_millis(1000),
                "generation {generation}: {ttl:?} out of jitter band"
            );
            let envelope: Value = serde_json::from_slice(&retries[generation as usize].body).unwrap();
            assert_eq!(envelope["retryCount"], generation + 1);
        }

        let statuses = reporter.statuses();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Processing,
                TaskStatus::RetryScheduled,
                TaskStatus::Processing,
                TaskStatus::RetryScheduled,
                TaskStatus::Processing,
                TaskStatus::RetryScheduled,
                TaskStatus::Processing,
                TaskStatus::Completed,
            ]
        );

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retry_budget_dead_letters_once() {
        let handler = TestHandler {
            fail_attempts: u32::MAX,
            error_message: "still broken".to_string(),
            ..Default::default()
        };
        let executions = Arc::clone(&handler.executions);
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime = WorkerRuntime::new(test_config(1, spec_policy()), broker.clone(), handler);

        runtime.start().await.unwrap();
        runtime.queue().enqueue(&task_with(&[])).await.unwrap();

        let b = broker.clone();
        eventually(move || b.published("tasks_dlq") == 1).await;
        let b = broker.clone();
        eventually(move || b.stats().acked == 4).await;

        assert_eq!(executions.load(SeqCst), 4, "initial + three retries");
        assert_eq!(broker.published("tasks_retry"), 3);
        assert_eq!(broker.stats().nacked_requeued, 0);

        let dlq = broker.published_messages("tasks_dlq");
        let envelope: Value = serde_json::from_slice(&dlq[0].body).unwrap();
        assert_eq!(envelope["error"], "still broken");
        assert_eq!(envelope["retryCount"], 3);
        assert!(envelope["sentToDLQ"].is_string());

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_skips_retries_entirely() {
        let reporter = Arc::new(RecordingReporter::default());
        let handler = TestHandler {
            fail_attempts: u32::MAX,
            error_message: "recipient rejected".to_string(),
            error_permanent: true,
            ..Default::default()
        };
        let executions = Arc::clone(&handler.executions);
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime = WorkerRuntime::new(test_config(1, spec_policy()), broker.clone(), handler)
            .with_reporter(reporter.clone());

        runtime.start().await.unwrap();
        runtime.queue().enqueue(&task_with(&[])).await.unwrap();

        let b = broker.clone();
        eventually(move || b.published("tasks_dlq") == 1).await;
        assert_eq!(executions.load(SeqCst), 1);
        assert_eq!(broker.published("tasks_retry"), 0);

        let dlq = broker.published_messages("tasks_dlq");
        let envelope: Value = serde_json::from_slice(&dlq[0].body).unwrap();
        assert_eq!(envelope["retryCount"], 0);
        assert_eq!(envelope["error"], "recipient rejected");

        assert_eq!(
            reporter.statuses(),
            vec![TaskStatus::Processing, TaskStatus::Failed]
        );

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_message_is_dead_lettered_despite_budget() {
        let handler = TestHandler {
            fail_attempts: u32::MAX,
            error_message: "upstream resource not found".to_string(),
            ..Default::default()
        };
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime = WorkerRuntime::new(test_config(1, spec_policy()), broker.clone(), handler);

        runtime.start().await.unwrap();
        runtime.queue().enqueue(&task_with(&[])).await.unwrap();

        let b = broker.clone();
        eventually(move || b.published("tasks_dlq") == 1).await;
        assert_eq!(broker.published("tasks_retry"), 0);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn handler_permanence_override_consults_the_code() {
        let handler = TestHandler {
            fail_attempts: u32::MAX,
            error_message: "mailbox unavailable".to_string(),
            error_code: Some("550".to_string()),
            treat_code_550_permanent: true,
            ..Default::default()
        };
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime = WorkerRuntime::new(test_config(1, spec_policy()), broker.clone(), handler);

        runtime.start().await.unwrap();
        runtime.queue().enqueue(&task_with(&[])).await.unwrap();

        let b = broker.clone();
        eventually(move || b.published("tasks_dlq") == 1).await;
        assert_eq!(broker.published("tasks_retry"), 0);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_bounds_concurrent_executions() {
        let gate = Arc::new(AtomicBool::new(false));
        let handler = TestHandler {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        let concurrent = Arc::clone(&handler.concurrent);
        let max_concurrent = Arc::clone(&handler.max_concurrent);
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime = WorkerRuntime::new(test_config(2, spec_policy()), broker.clone(), handler);

        runtime.start().await.unwrap();
        for _ in 0..6 {
            runtime.queue().enqueue(&task_with(&[])).await.unwrap();
        }

        let c = Arc::clone(&concurrent);
        eventually(move || c.load(SeqCst) == 2).await;
        for _ in 0..20 {
            assert!(concurrent.load(SeqCst) <= 2);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        gate.store(true, SeqCst);
        let b = broker.clone();
        eventually(move || b.stats().acked == 6).await;
        assert_eq!(max_concurrent.load(SeqCst), 2);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_does_not_stop_the_worker() {
        let handler = TestHandler {
            panic_attempts: 1,
            ..Default::default()
        };
        let executions = Arc::clone(&handler.executions);
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime = WorkerRuntime::new(test_config(2, spec_policy()), broker.clone(), handler);

        runtime.start().await.unwrap();
        runtime.queue().enqueue(&task_with(&[])).await.unwrap();
        runtime.queue().enqueue(&task_with(&[])).await.unwrap();

        let b = broker.clone();
        eventually(move || b.stats().acked == 1).await;
        assert!(runtime.is_running());
        assert_eq!(executions.load(SeqCst), 2);
        // the panicked delivery stays unsettled until the broker hands it out again
        assert_eq!(broker.stats().unacked, 1);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initialization_aborts_start() {
        let handler = TestHandler {
            init_fails: true,
            ..Default::default()
        };
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime = WorkerRuntime::new(test_config(1, spec_policy()), broker.clone(), handler);

        let result = runtime.start().await;
        assert!(matches!(result, Err(RelayError::Initialization { .. })));
        assert!(!runtime.is_running());
        assert!(
            !broker.queue_declared("tasks"),
            "topology must not be declared when initialization fails"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_flags_guard_double_transitions() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime =
            WorkerRuntime::new(test_config(1, spec_policy()), broker, TestHandler::default());

        assert!(matches!(
            runtime.shutdown().await,
            Err(RelayError::NotRunning)
        ));
        runtime.start().await.unwrap();
        assert!(matches!(
            runtime.start().await,
            Err(RelayError::AlreadyRunning)
        ));
        runtime.shutdown().await.unwrap();
        assert!(matches!(
            runtime.shutdown().await,
            Err(RelayError::NotRunning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_inflight_work_and_releases_resources() {
        let gate = Arc::new(AtomicBool::new(false));
        let handler = TestHandler {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        let executions = Arc::clone(&handler.executions);
        let shutdown_called = Arc::clone(&handler.shutdown_called);
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime = WorkerRuntime::new(test_config(1, spec_policy()), broker.clone(), handler);

        runtime.start().await.unwrap();
        runtime.queue().enqueue(&task_with(&[])).await.unwrap();
        let e = Arc::clone(&executions);
        eventually(move || e.load(SeqCst) == 1).await;

        let (result, _) = tokio::join!(runtime.shutdown(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            gate.store(true, SeqCst);
        });
        result.unwrap();

        assert_eq!(broker.stats().acked, 1, "in-flight task finished first");
        assert!(shutdown_called.load(SeqCst));
        assert!(!runtime.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn handler_cleanup_errors_never_fail_shutdown() {
        let handler = TestHandler {
            shutdown_fails: true,
            ..Default::default()
        };
        let shutdown_called = Arc::clone(&handler.shutdown_called);
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime = WorkerRuntime::new(test_config(1, spec_policy()), broker, handler);

        runtime.start().await.unwrap();
        runtime.shutdown().await.unwrap();
        assert!(shutdown_called.load(SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_report_carries_schedule_details() {
        let reporter = Arc::new(RecordingReporter::default());
        let handler = TestHandler {
            fail_attempts: 1,
            error_message: "busy".to_string(),
            log_lines: true,
            ..Default::default()
        };
        let broker = Arc::new(InMemoryBroker::new());
        let mut runtime = WorkerRuntime::new(test_config(1, spec_policy()), broker.clone(), handler)
            .with_reporter(reporter.clone());

        runtime.start().await.unwrap();
        runtime.queue().enqueue(&task_with(&[])).await.unwrap();

        let b = broker.clone();
        eventually(move || b.stats().acked == 2).await;

        let updates = reporter.updates();
        let retry = updates
            .iter()
            .find(|u| u.status == TaskStatus::RetryScheduled)
            .unwrap();
        assert_eq!(retry.error_message.as_deref(), Some("busy"));
        assert_eq!(retry.retry_count, Some(0));
        assert!(retry.next_retry.is_some());
        assert_eq!(retry.logs.as_ref().unwrap().len(), 1);

        runtime.shutdown().await.unwrap();
    }
}
