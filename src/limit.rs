//! Minimum-interval throttle for rate-limited handler resources.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Spaces actions at least `min_interval` apart.
///
/// Built for handlers fronting rate-limited upstreams (an SMTP relay, a
/// scraping target): call [`acquire`](Self::acquire) before each send and
/// the worker's throughput stays under the limit no matter how many tasks
/// run concurrently. The interval lock is held across the wait, so
/// concurrent acquirers line up and leave at the configured spacing.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last_action: Mutex<Option<Instant>>,
}

impl Throttle {
    /// A throttle allowing one action per `min_interval`.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_action: Mutex::new(None),
        }
    }

    /// Wait until an action is allowed, then claim the slot.
    pub async fn acquire(&self) {
        let mut last = self.last_action.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
