//! Keyed work queues with dedup, delayed adds, and retry rate limiting.
//!
//! Items are deduplicated while waiting: an `add` for a queued item is a
//! no-op, and an `add` for an item currently being processed marks it dirty
//! so it re-fires exactly once after `done`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

/// Per-item retry delay policy.
pub trait RateLimiter: Send + Sync {
    /// Records a failure for the item and returns the delay before retry.
    fn when(&self, item: &str) -> Duration;
    /// Clears the item's failure history.
    fn forget(&self, item: &str);
    fn retries(&self, item: &str) -> u32;
}

/// Fixed fast delay for the first `max_fast` attempts, then a slow delay.
pub struct FastSlowRateLimiter {
    fast: Duration,
    slow: Duration,
    max_fast: u32,
    attempts: Mutex<FxHashMap<String, u32>>,
}

impl FastSlowRateLimiter {
    pub fn new(fast: Duration, slow: Duration, max_fast: u32) -> Self {
        Self { fast, slow, max_fast, attempts: Mutex::new(FxHashMap::default()) }
    }
}

impl RateLimiter for FastSlowRateLimiter {
    fn when(&self, item: &str) -> Duration {
        let mut attempts = self.attempts.lock().unwrap();
        let n = attempts.entry(item.to_string()).or_insert(0);
        *n += 1;
        if *n <= self.max_fast {
            self.fast
        } else {
            self.slow
        }
    }

    fn forget(&self, item: &str) {
        self.attempts.lock().unwrap().remove(item);
    }

    fn retries(&self, item: &str) -> u32 {
        self.attempts.lock().unwrap().get(item).copied().unwrap_or(0)
    }
}

/// Exponential backoff per item: `base * 2^failures`, capped.
pub struct ExponentialRateLimiter {
    base: Duration,
    cap: Duration,
    attempts: Mutex<FxHashMap<String, u32>>,
}

impl ExponentialRateLimiter {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempts: Mutex::new(FxHashMap::default()) }
    }
}

impl RateLimiter for ExponentialRateLimiter {
    fn when(&self, item: &str) -> Duration {
        let mut attempts = self.attempts.lock().unwrap();
        let n = attempts.entry(item.to_string()).or_insert(0);
        let exp = (*n).min(24);
        *n += 1;
        (self.base * (1u32 << exp)).min(self.cap)
    }

    fn forget(&self, item: &str) {
        self.attempts.lock().unwrap().remove(item);
    }

    fn retries(&self, item: &str) -> u32 {
        self.attempts.lock().unwrap().get(item).copied().unwrap_or(0)
    }
}

/// Worst-of combinator over several limiters.
pub struct MaxOfRateLimiter(pub Vec<Box<dyn RateLimiter>>);

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, item: &str) -> Duration {
        self.0.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &str) {
        for l in &self.0 {
            l.forget(item);
        }
    }

    fn retries(&self, item: &str) -> u32 {
        self.0.iter().map(|l| l.retries(item)).max().unwrap_or(0)
    }
}

/// Default controller retry policy: 1 ms for the first 30 attempts then
/// 2 min, combined with per-item exponential backoff from 5 ms up to 30 s.
pub fn default_controller_rate_limiter() -> Arc<dyn RateLimiter> {
    Arc::new(MaxOfRateLimiter(vec![
        Box::new(FastSlowRateLimiter::new(
            Duration::from_millis(1),
            Duration::from_secs(120),
            30,
        )),
        Box::new(ExponentialRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(30),
        )),
    ]))
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    shutting_down: bool,
}

/// A shutdown-aware dedup work queue.
pub struct WorkQueue {
    name: String,
    limiter: Arc<dyn RateLimiter>,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, limiter: Arc<dyn RateLimiter>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            limiter,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    pub fn add(&self, item: &str) {
        {
            let mut s = self.state.lock().unwrap();
            if s.shutting_down || s.dirty.contains(item) {
                return;
            }
            s.dirty.insert(item.to_string());
            if s.processing.contains(item) {
                return;
            }
            s.queue.push_back(item.to_string());
        }
        self.notify.notify_waiters();
    }

    pub fn add_after(self: &Arc<Self>, item: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        let item = item.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&item);
        });
    }

    pub fn add_rate_limited(self: &Arc<Self>, item: &str) {
        let delay = self.limiter.when(item);
        debug!(queue = %self.name, item = %item, delay_ms = delay.as_millis() as u64, "requeue");
        self.add_after(item, delay);
    }

    /// Blocks until an item is available or the queue is shut down and
    /// drained, in which case None is returned.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut s = self.state.lock().unwrap();
                if let Some(item) = s.queue.pop_front() {
                    s.dirty.remove(&item);
                    s.processing.insert(item.clone());
                    return Some(item);
                }
                if s.shutting_down {
                    return None;
                }
            }
            notified.as_mut().await;
        }
    }

    /// Marks processing finished; if the item was re-added meanwhile it is
    /// queued again for a single re-fire.
    pub fn done(&self, item: &str) {
        let refire = {
            let mut s = self.state.lock().unwrap();
            s.processing.remove(item);
            if s.dirty.contains(item) && !s.shutting_down {
                s.queue.push_back(item.to_string());
                true
            } else {
                false
            }
        };
        if refire {
            self.notify.notify_waiters();
        }
    }

    pub fn forget(&self, item: &str) {
        self.limiter.forget(item);
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        self.state.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn shutting_down(&self) -> bool {
        self.state.lock().unwrap().shutting_down
    }
}
