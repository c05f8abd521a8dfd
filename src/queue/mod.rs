//! Broker seam and the queue client built on top of it.
//!
//! The [`Broker`] trait is the narrow set of channel operations the runtime
//! needs (declare, prefetch, consume, ack/nack, publish with TTL, close).
//! The crate ships [`InMemoryBroker`] for development and tests; production
//! deployments implement the trait over their broker of choice.
//!
//! [`QueueClient`] owns the reliability topology: a durable main queue, a
//! dead-letter queue, and a retry queue whose expired messages re-enter the
//! main queue. Retry delays are plain per-message TTLs, so no process needs
//! to stay alive for a delay to elapse.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::config::QueueConfig;
use crate::error::RelayResult;
use crate::task::Task;

pub mod memory;
pub use memory::InMemoryBroker;

/// Queue declaration parameters.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Survive broker restarts
    pub durable: bool,
    /// Where expired messages are routed (default-exchange dead-lettering)
    pub dead_letter_to: Option<String>,
}

/// Publish parameters.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Persist the message to disk
    pub persistent: bool,
    /// Per-message TTL; AMQP implementations encode it as the stringified
    /// integer millisecond `expiration` property
    pub expiration: Option<Duration>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            expiration: None,
        }
    }
}

/// One raw delivery from the broker.
#[derive(Debug)]
pub struct Delivery {
    /// Acknowledgement tag
    pub tag: u64,
    /// Message body
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
}

/// Channel operations a broker must provide.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue; idempotent for identical parameters.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> RelayResult<()>;

    /// Cap the number of unacknowledged deliveries handed to this client.
    async fn set_prefetch(&self, count: u16) -> RelayResult<()>;

    /// Start consuming `queue`. Deliveries arrive on the returned channel
    /// and count against the prefetch cap until acked or nacked.
    async fn consume(&self, queue: &str) -> RelayResult<mpsc::Receiver<Delivery>>;

    /// Acknowledge a delivery.
    async fn ack(&self, tag: u64) -> RelayResult<()>;

    /// Reject a delivery, optionally returning it to its queue.
    async fn nack(&self, tag: u64, requeue: bool) -> RelayResult<()>;

    /// Publish a message to a queue.
    async fn publish(&self, queue: &str, body: Vec<u8>, options: PublishOptions) -> RelayResult<()>;

    /// Close the connection. Idempotent; unacknowledged deliveries return
    /// to their queues.
    async fn close(&self) -> RelayResult<()>;
}

/// Shared handle to a broker implementation.
pub type SharedBroker = Arc<dyn Broker>;

/// A parsed task plus the delivery it arrived on.
///
/// Terminal operations on [`QueueClient`] take this by value, so each
/// delivery can receive exactly one of ack, retry or dead-letter.
#[derive(Debug)]
pub struct TaskDelivery {
    /// The parsed task envelope
    pub task: Task,
    tag: u64,
}

/// Topology management and reliable task traffic over a [`Broker`].
#[derive(Clone)]
pub struct QueueClient {
    broker: SharedBroker,
    config: QueueConfig,
}

impl QueueClient {
    /// Wrap a broker with the given queue configuration.
    pub fn new(broker: SharedBroker, config: QueueConfig) -> Self {
        Self { broker, config }
    }

    /// The queue configuration in use.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Declare the three-queue topology and apply prefetch.
    ///
    /// Main and dead-letter queues are plain durable queues. The retry
    /// queue dead-letters into the main queue: a message published there
    /// with a TTL re-enters the main queue when the TTL elapses.
    pub async fn setup(&self) -> RelayResult<()> {
        self.broker
            .declare_queue(
                &self.config.main_queue,
                QueueOptions {
                    durable: true,
                    dead_letter_to: None,
                },
            )
            .await?;
        self.broker
            .declare_queue(
                &self.config.dead_letter_queue,
                QueueOptions {
                    durable: true,
                    dead_letter_to: None,
                },
            )
            .await?;
        self.broker
            .declare_queue(
                &self.config.retry_queue,
                QueueOptions {
                    durable: true,
                    dead_letter_to: Some(self.config.main_queue.clone()),
                },
            )
            .await?;
        self.broker.set_prefetch(self.config.prefetch).await?;
        tracing::info!(
            main = %self.config.main_queue,
            retry = %self.config.retry_queue,
            dead_letter = %self.config.dead_letter_queue,
            prefetch = self.config.prefetch,
            "queue topology ready"
        );
        Ok(())
    }

    /// Publish a task to the main queue (persistent, no TTL).
    pub async fn enqueue(&self, task: &Task) -> RelayResult<()> {
        let body = serde_json::to_vec(task)?;
        self.broker
            .publish(&self.config.main_queue, body, PublishOptions::default())
            .await
    }

    /// Start consuming the main queue.
    ///
    /// Each raw delivery is parsed as a task envelope. Parse failures are
    /// logged and nacked with requeue, so a malformed message goes back to
    /// the queue and will be redelivered until an operator removes it.
    pub async fn consume(&self) -> RelayResult<mpsc::Receiver<TaskDelivery>> {
        let mut raw = self.broker.consume(&self.config.main_queue).await?;
        let capacity = usize::from(self.config.prefetch.max(1));
        let (tx, rx) = mpsc::channel(capacity);
        let broker = Arc::clone(&self.broker);
        tokio::spawn(async move {
            while let Some(delivery) = raw.recv().await {
                match serde_json::from_slice::<Task>(&delivery.body) {
                    Ok(task) => {
                        let parsed = TaskDelivery {
                            task,
                            tag: delivery.tag,
                        };
                        if tx.send(parsed).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "failed to parse task envelope, requeueing");
                        if let Err(nack_err) = broker.nack(delivery.tag, true).await {
                            tracing::warn!(error = %nack_err, "could not requeue malformed message");
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Acknowledge a successfully processed delivery.
    pub async fn ack(&self, delivery: TaskDelivery) -> RelayResult<()> {
        self.broker.ack(delivery.tag).await
    }

    /// Schedule a retry: publish a copy to the retry queue with the delay
    /// as its TTL, then acknowledge the original.
    ///
    /// The copy carries `retryCount + 1` and a `retryScheduled` stamp and is
    /// persistent. The retry queue is FIFO, so a long-TTL message at its
    /// head delays shorter-TTL messages behind it; the backoff ladder keeps
    /// same-generation delays monotone, which bounds the skew in practice.
    pub async fn schedule_retry(&self, delivery: TaskDelivery, delay: Duration) -> RelayResult<()> {
        let envelope = delivery.task.retry_envelope(Utc::now());
        let body = serde_json::to_vec(&envelope)?;
        self.broker
            .publish(
                &self.config.retry_queue,
                body,
                PublishOptions {
                    persistent: true,
                    expiration: Some(delay),
                },
            )
            .await?;
        self.broker.ack(delivery.tag).await?;
        tracing::debug!(
            task_id = %delivery.task.id,
            delay_ms = delay.as_millis() as u64,
            retry_count = delivery.task.retry_count + 1,
            "retry scheduled"
        );
        Ok(())
    }

    /// Dead-letter a task: publish a copy with the failure message to the
    /// dead-letter queue, then acknowledge the original.
    pub async fn send_to_dead_letter(
        &self,
        delivery: TaskDelivery,
        error: &str,
    ) -> RelayResult<()> {
        let envelope = delivery.task.dead_letter_envelope(error, Utc::now());
        let body = serde_json::to_vec(&envelope)?;
        self.broker
            .publish(
                &self.config.dead_letter_queue,
                body,
                PublishOptions::default(),
            )
            .await?;
        self.broker.ack(delivery.tag).await?;
        tracing::debug!(task_id = %delivery.task.id, error = %error, "task dead-lettered");
        Ok(())
    }

    /// Close the underlying broker connection.
    pub async fn close(&self) -> RelayResult<()> {
        self.broker.close().await
    }
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    fn test_config() -> QueueConfig {
        QueueConfig {
            url: "memory://".to_string(),
            main_queue: "tasks".to_string(),
            retry_queue: "tasks_retry".to_string(),
            dead_letter_queue: "tasks_dlq".to_string(),
            prefetch: 4,
        }
    }

    fn client() -> (Arc<InMemoryBroker>, QueueClient) {
        let broker = Arc::new(InMemoryBroker::new());
        let client = QueueClient::new(broker.clone(), test_config());
        (broker, client)
    }

    fn sample_task() -> Task {
        let mut payload = Map::new();
        payload.insert("to".to_string(), json!("a@b.c"));
        Task::new("send_email", payload)
    }

    #[tokio::test]
    async fn setup_declares_all_three_queues() {
        let (broker, client) = client();
        client.setup().await.unwrap();
        assert!(broker.queue_declared("tasks"));
        assert!(broker.queue_declared("tasks_retry"));
        assert!(broker.queue_declared("tasks_dlq"));
        assert_eq!(broker.prefetch(), 4);
        // idempotent
        client.setup().await.unwrap();
    }

    #[tokio::test]
    async fn consume_delivers_parsed_tasks() {
        let (broker, client) = client();
        client.setup().await.unwrap();
        let task = sample_task();
        client.enqueue(&task).await.unwrap();

        let mut rx = client.consume().await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.task.id, task.id);
        assert_eq!(delivery.task.task_type, "send_email");
        assert_eq!(delivery.task.retry_count, 0);

        client.ack(delivery).await.unwrap();
        assert_eq!(broker.stats().unacked, 0);
        assert_eq!(broker.stats().acked, 1);
    }

    #[tokio::test]
    async fn malformed_message_is_requeued_not_retried() {
        let (broker, client) = client();
        client.setup().await.unwrap();
        broker
            .publish("tasks", b"{not json".to_vec(), PublishOptions::default())
            .await
            .unwrap();

        let mut rx = client.consume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rx.try_recv().is_err(), "malformed body must not parse");
        let stats = broker.stats();
        assert!(stats.nacked_requeued >= 1, "message must have been requeued");
        assert_eq!(broker.published("tasks_retry"), 0);
        assert_eq!(broker.published("tasks_dlq"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_retry_publishes_copy_then_acks() {
        let (broker, client) = client();
        client.setup().await.unwrap();
        let mut task = sample_task();
        task.retry_count = 1;
        client.enqueue(&task).await.unwrap();

        let mut rx = client.consume().await.unwrap();
        let delivery = rx.recv().await.unwrap();
        client
            .schedule_retry(delivery, Duration::from_secs(5))
            .await
            .unwrap();

        let published = broker.published_messages("tasks_retry");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].expiration, Some(Duration::from_secs(5)));
        assert!(published[0].persistent);
        let envelope: serde_json::Value = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(envelope["retryCount"], 2);
        assert_eq!(envelope["to"], "a@b.c");
        assert!(envelope["retryScheduled"].is_string());

        let stats = broker.stats();
        assert_eq!(stats.unacked, 0);
        assert_eq!(stats.acked, 1);
        assert_eq!(broker.depth("tasks_retry"), 1);
        assert_eq!(broker.depth("tasks"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_retry_copy_reenters_the_main_queue() {
        let (broker, client) = client();
        client.setup().await.unwrap();
        client.enqueue(&sample_task()).await.unwrap();

        let mut rx = client.consume().await.unwrap();
        let delivery = rx.recv().await.unwrap();
        client
            .schedule_retry(delivery, Duration::from_secs(3))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        let redelivered = rx.recv().await.unwrap();
        assert_eq!(redelivered.task.retry_count, 1);
        assert_eq!(broker.depth("tasks_retry"), 0);
        client.ack(redelivered).await.unwrap();
    }

    #[tokio::test]
    async fn dead_letter_copy_carries_error_and_stamp() {
        let (broker, client) = client();
        client.setup().await.unwrap();
        client.enqueue(&sample_task()).await.unwrap();

        let mut rx = client.consume().await.unwrap();
        let delivery = rx.recv().await.unwrap();
        client
            .send_to_dead_letter(delivery, "mailbox unavailable")
            .await
            .unwrap();

        let published = broker.published_messages("tasks_dlq");
        assert_eq!(published.len(), 1);
        assert!(published[0].persistent);
        assert_eq!(published[0].expiration, None);
        let envelope: serde_json::Value = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(envelope["error"], "mailbox unavailable");
        assert!(envelope["sentToDLQ"].is_string());
        assert_eq!(envelope["to"], "a@b.c");
        assert_eq!(broker.depth("tasks_dlq"), 1);
        assert_eq!(broker.stats().acked, 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_, client) = client();
        client.setup().await.unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();
    }
}
