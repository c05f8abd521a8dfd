//! In-memory broker for development and tests.
//!
//! Implements the full [`Broker`] contract in process memory: named queues,
//! a prefetch-bounded delivery pump, per-message TTLs that dead-letter into
//! the queue's configured target, requeue-on-nack and close-time redelivery.
//! Nothing survives a restart; production deployments implement [`Broker`]
//! over a real message broker instead.
//!
//! Beyond the trait, the type exposes counters and a publish log
//! ([`stats`](InMemoryBroker::stats), [`depth`](InMemoryBroker::depth),
//! [`published_messages`](InMemoryBroker::published_messages)) so tests can
//! assert on broker traffic directly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use super::{Broker, Delivery, PublishOptions, QueueOptions};
use crate::error::{RelayError, RelayResult};

/// One message waiting in a queue.
#[derive(Debug, Clone)]
struct QueuedMessage {
    msg_id: u64,
    body: Vec<u8>,
    redelivered: bool,
}

/// One message delivered but not yet acked or nacked.
#[derive(Debug, Clone)]
struct UnackedMessage {
    queue: String,
    body: Vec<u8>,
}

#[derive(Debug)]
struct QueueState {
    dead_letter_to: Option<String>,
    ready: VecDeque<QueuedMessage>,
}

/// A publish recorded in the inspection log.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    /// Message body as published
    pub body: Vec<u8>,
    /// Persistence flag from the publish options
    pub persistent: bool,
    /// Per-message TTL from the publish options
    pub expiration: Option<Duration>,
}

/// Counters over the broker's lifetime.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    /// Messages currently waiting across all queues
    pub ready: usize,
    /// Deliveries handed out and not yet settled
    pub unacked: usize,
    /// Positive acknowledgements
    pub acked: u64,
    /// Rejections that returned the message to its queue
    pub nacked_requeued: u64,
    /// Rejections that discarded the message
    pub nacked_dropped: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    consumers: HashMap<String, mpsc::Sender<Delivery>>,
    unacked: HashMap<u64, UnackedMessage>,
    publish_log: HashMap<String, Vec<PublishedMessage>>,
    prefetch: u16,
    acked: u64,
    nacked_requeued: u64,
    nacked_dropped: u64,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BrokerState>,
    /// Woken on every publish/ack/nack/close so delivery pumps re-check
    ready: Notify,
    next_id: AtomicU64,
}

/// In-memory [`Broker`] implementation.
#[derive(Debug)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Create an empty broker with unlimited prefetch.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                ready: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Whether `queue` has been declared.
    pub fn queue_declared(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Messages currently waiting in `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// The prefetch cap currently in force (0 means unlimited).
    pub fn prefetch(&self) -> u16 {
        self.lock().prefetch
    }

    /// How many messages were ever published to `queue`.
    pub fn published(&self, queue: &str) -> u64 {
        self.lock()
            .publish_log
            .get(queue)
            .map(|log| log.len() as u64)
            .unwrap_or(0)
    }

    /// The full publish log for `queue`, oldest first.
    pub fn published_messages(&self, queue: &str) -> Vec<PublishedMessage> {
        self.lock()
            .publish_log
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Current counters.
    pub fn stats(&self) -> BrokerStats {
        let state = self.lock();
        BrokerStats {
            ready: state.queues.values().map(|q| q.ready.len()).sum(),
            unacked: state.unacked.len(),
            acked: state.acked,
            nacked_requeued: state.nacked_requeued,
            nacked_dropped: state.nacked_dropped,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        lock_state(&self.inner)
    }

    fn fresh_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_open(state: &BrokerState) -> RelayResult<()> {
        if state.closed {
            return Err(RelayError::queue("broker connection is closed"));
        }
        Ok(())
    }

    /// Discard or dead-letter `msg_id` from `queue` once its TTL elapses.
    fn spawn_expiry(&self, queue: String, msg_id: u64, ttl: Duration) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let routed = {
                let mut state = lock_state(&inner);
                if state.closed {
                    return;
                }
                let Some(source) = state.queues.get_mut(&queue) else {
                    return;
                };
                let position = source.ready.iter().position(|m| m.msg_id == msg_id);
                // a missing message was consumed before its TTL elapsed
                let Some(message) = position.and_then(|at| source.ready.remove(at)) else {
                    return;
                };
                let target = source.dead_letter_to.clone();
                match target {
                    Some(target) => match state.queues.get_mut(&target) {
                        Some(dest) => {
                            dest.ready.push_back(QueuedMessage {
                                redelivered: false,
                                ..message
                            });
                            true
                        }
                        None => {
                            tracing::warn!(
                                queue = %queue,
                                target = %target,
                                "dead-letter target missing, discarding expired message"
                            );
                            false
                        }
                    },
                    None => false,
                }
            };
            if routed {
                inner.ready.notify_waiters();
            }
        });
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> RelayResult<()> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        if let Some(existing) = state.queues.get(name) {
            if existing.dead_letter_to != options.dead_letter_to {
                return Err(RelayError::queue(format!(
                    "queue '{name}' already declared with different dead-letter target"
                )));
            }
            return Ok(());
        }
        state.queues.insert(
            name.to_string(),
            QueueState {
                dead_letter_to: options.dead_letter_to,
                ready: VecDeque::new(),
            },
        );
        tracing::debug!(queue = %name, "queue declared");
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> RelayResult<()> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        state.prefetch = count;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> RelayResult<mpsc::Receiver<Delivery>> {
        let capacity;
        {
            let mut state = self.lock();
            Self::ensure_open(&state)?;
            if !state.queues.contains_key(queue) {
                return Err(RelayError::queue(format!("queue '{queue}' not declared")));
            }
            capacity = usize::from(state.prefetch.max(1));
            state.consumers.remove(queue);
        }

        let (tx, rx) = mpsc::channel(capacity);
        self.lock()
            .consumers
            .insert(queue.to_string(), tx.clone());

        let inner = Arc::clone(&self.inner);
        let queue = queue.to_string();
        tokio::spawn(async move {
            pump_deliveries(inner, queue, tx).await;
        });
        Ok(rx)
    }

    async fn ack(&self, tag: u64) -> RelayResult<()> {
        {
            let mut state = self.lock();
            if state.unacked.remove(&tag).is_none() {
                return Err(RelayError::queue(format!("unknown delivery tag {tag}")));
            }
            state.acked += 1;
        }
        self.inner.ready.notify_waiters();
        Ok(())
    }

    async fn nack(&self, tag: u64, requeue: bool) -> RelayResult<()> {
        {
            let mut state = self.lock();
            let Some(message) = state.unacked.remove(&tag) else {
                return Err(RelayError::queue(format!("unknown delivery tag {tag}")));
            };
            if requeue {
                state.nacked_requeued += 1;
                let msg_id = self.fresh_id();
                if let Some(origin) = state.queues.get_mut(&message.queue) {
                    origin.ready.push_front(QueuedMessage {
                        msg_id,
                        body: message.body,
                        redelivered: true,
                    });
                }
            } else {
                state.nacked_dropped += 1;
            }
        }
        self.inner.ready.notify_waiters();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>, options: PublishOptions) -> RelayResult<()> {
        let msg_id = self.fresh_id();
        {
            let mut state = self.lock();
            Self::ensure_open(&state)?;
            let Some(target) = state.queues.get_mut(queue) else {
                return Err(RelayError::queue(format!("queue '{queue}' not declared")));
            };
            target.ready.push_back(QueuedMessage {
                msg_id,
                body: body.clone(),
                redelivered: false,
            });
            state
                .publish_log
                .entry(queue.to_string())
                .or_default()
                .push(PublishedMessage {
                    body,
                    persistent: options.persistent,
                    expiration: options.expiration,
                });
        }
        if let Some(ttl) = options.expiration {
            self.spawn_expiry(queue.to_string(), msg_id, ttl);
        }
        self.inner.ready.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> RelayResult<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.consumers.clear();
            // hand unacked deliveries back to their queues for redelivery
            let unacked: Vec<_> = state.unacked.drain().collect();
            for (_, message) in unacked {
                let msg_id = self.fresh_id();
                if let Some(origin) = state.queues.get_mut(&message.queue) {
                    origin.ready.push_front(QueuedMessage {
                        msg_id,
                        body: message.body,
                        redelivered: true,
                    });
                }
            }
        }
        self.inner.ready.notify_waiters();
        tracing::debug!("in-memory broker closed");
        Ok(())
    }
}

fn lock_state(inner: &Inner) -> std::sync::MutexGuard<'_, BrokerState> {
    match inner.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Deliver ready messages to a consumer while the prefetch window allows.
async fn pump_deliveries(inner: Arc<Inner>, queue: String, tx: mpsc::Sender<Delivery>) {
    loop {
        // register for wakeups before inspecting state, otherwise a publish
        // landing between the check and the await would be missed
        let mut wakeup = std::pin::pin!(inner.ready.notified());
        wakeup.as_mut().enable();
        let next = {
            let mut state = lock_state(&inner);
            if state.closed {
                break;
            }
            let window_open =
                state.prefetch == 0 || state.unacked.len() < usize::from(state.prefetch);
            if window_open {
                state
                    .queues
                    .get_mut(&queue)
                    .and_then(|q| q.ready.pop_front())
            } else {
                None
            }
        };

        match next {
            Some(message) => {
                let tag = inner.next_id.fetch_add(1, Ordering::Relaxed);
                {
                    let mut state = lock_state(&inner);
                    state.unacked.insert(
                        tag,
                        UnackedMessage {
                            queue: queue.clone(),
                            body: message.body.clone(),
                        },
                    );
                }
                let delivery = Delivery {
                    tag,
                    body: message.body,
                    redelivered: message.redelivered,
                };
                if tx.send(delivery).await.is_err() {
                    // consumer went away; put the message back unless close
                    // already requeued it
                    let mut state = lock_state(&inner);
                    if let Some(message) = state.unacked.remove(&tag) {
                        let msg_id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                        if let Some(origin) = state.queues.get_mut(&message.queue) {
                            origin.ready.push_front(QueuedMessage {
                                msg_id,
                                body: message.body,
                                redelivered: true,
                            });
                        }
                    }
                    break;
                }
            }
            None => wakeup.await,
        }
    }
}
