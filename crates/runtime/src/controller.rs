//! Per-kind controller: informer events in, keyed dispatches out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, histogram};
use rudder_core::{key_for, key_parse, Kind};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::is_conflict;
use crate::informer::Informer;
use crate::queue::{default_controller_rate_limiter, RateLimiter, WorkQueue};
use crate::{ChangeHandler, RuntimeError};

/// Distributes keys across a controller's queues. Sharding isolates noisy
/// keys from the rest of the kind.
pub trait WorkerQueueSplitter: Send + Sync {
    fn queues(&self) -> usize;
    fn split(&self, key: &str) -> usize;
}

pub struct SingleQueueSplitter;

impl WorkerQueueSplitter for SingleQueueSplitter {
    fn queues(&self) -> usize {
        1
    }

    fn split(&self, _key: &str) -> usize {
        0
    }
}

#[derive(Default)]
pub struct ControllerOptions {
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub splitter: Option<Arc<dyn WorkerQueueSplitter>>,
}

#[derive(Default)]
struct CtrlState {
    queues: Option<Vec<Arc<WorkQueue>>>,
    start_keys: Vec<(String, Duration)>,
    started: bool,
    events_registered: bool,
    workers: Vec<JoinHandle<()>>,
}

/// Owns one informer and the sharded work queues for a kind.
pub struct Controller {
    kind: Kind,
    name: String,
    informer: Arc<Informer>,
    handler: Arc<dyn ChangeHandler>,
    splitter: Arc<dyn WorkerQueueSplitter>,
    rate_limiter: Arc<dyn RateLimiter>,
    state: Mutex<CtrlState>,
}

/// `_<letter><space>` keys bypass the informer fetch and dispatch with no
/// object payload.
pub(crate) fn is_special_key(key: &str) -> bool {
    let b = key.as_bytes();
    b.len() > 2 && b[0] == b'_' && b[2] == b' '
}

impl Controller {
    pub fn new(
        kind: Kind,
        informer: Arc<Informer>,
        handler: Arc<dyn ChangeHandler>,
        opts: ControllerOptions,
    ) -> Arc<Self> {
        let name = kind.to_string();
        Arc::new(Self {
            kind,
            name,
            informer,
            handler,
            splitter: opts.splitter.unwrap_or_else(|| Arc::new(SingleQueueSplitter)),
            rate_limiter: opts.rate_limiter.unwrap_or_else(default_controller_rate_limiter),
            state: Mutex::new(CtrlState::default()),
        })
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn informer(&self) -> Arc<Informer> {
        self.informer.clone()
    }

    /// Idempotent. Blocks until the informer has synced, then spawns the
    /// worker pool and flushes any keys enqueued before start.
    pub async fn start(
        self: &Arc<Self>,
        ct: &CancellationToken,
        workers: usize,
    ) -> Result<(), RuntimeError> {
        {
            let mut st = self.state.lock().unwrap();
            if st.started {
                return Ok(());
            }
            if !st.events_registered {
                st.events_registered = true;
                let this = Arc::downgrade(self);
                self.informer.add_event_handler(Arc::new(move |ev| {
                    if let Some(c) = this.upgrade() {
                        let obj = ev.obj();
                        c.enqueue_key(&key_for(&obj.meta.namespace, &obj.meta.name));
                    }
                }));
            }
        }

        self.informer.start(ct.clone());
        self.informer.wait_for_sync(ct).await?;

        let queue_count = self.splitter.queues().max(1);
        let queues: Vec<Arc<WorkQueue>> = (0..queue_count)
            .map(|i| WorkQueue::new(format!("{}-{}", self.name, i), self.rate_limiter.clone()))
            .collect();
        let per_queue = (workers / queue_count).max(1);

        {
            let mut st = self.state.lock().unwrap();
            if st.started {
                return Ok(());
            }
            for (key, after) in std::mem::take(&mut st.start_keys) {
                let q = &queues[self.splitter.split(&key)];
                if after.is_zero() {
                    q.add(&key);
                } else {
                    q.add_after(&key, after);
                }
            }
            info!(controller = %self.name, workers = per_queue * queue_count, "starting controller");
            for q in &queues {
                st.workers.push(tokio::spawn(run_queue(
                    self.clone(),
                    q.clone(),
                    ct.clone(),
                    per_queue,
                )));
            }
            st.queues = Some(queues);
            st.started = true;
        }

        let this = self.clone();
        let ct = ct.clone();
        tokio::spawn(async move {
            ct.cancelled().await;
            let mut st = this.state.lock().unwrap();
            if let Some(queues) = &st.queues {
                for q in queues {
                    q.shut_down();
                }
            }
            st.started = false;
            info!(controller = %this.name, "shutting down workers");
        });

        Ok(())
    }

    pub fn enqueue(self: &Arc<Self>, namespace: &str, name: &str) {
        self.enqueue_key_after(&key_for(namespace, name), Duration::ZERO);
    }

    pub fn enqueue_after(self: &Arc<Self>, namespace: &str, name: &str, delay: Duration) {
        self.enqueue_key_after(&key_for(namespace, name), delay);
    }

    pub fn enqueue_key(self: &Arc<Self>, key: &str) {
        self.enqueue_key_after(key, Duration::ZERO);
    }

    /// Keys enqueued before start are buffered and flushed once the queues
    /// exist.
    pub fn enqueue_key_after(self: &Arc<Self>, key: &str, delay: Duration) {
        let mut st = self.state.lock().unwrap();
        match &st.queues {
            None => st.start_keys.push((key.to_string(), delay)),
            Some(queues) => {
                let q = &queues[self.splitter.split(key)];
                if delay.is_zero() {
                    q.add(key);
                } else {
                    q.add_after(key, delay);
                }
            }
        }
    }

    pub(crate) fn take_worker_handles(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.state.lock().unwrap().workers)
    }

    async fn sync(&self, ct: &CancellationToken, key: &str) -> anyhow::Result<()> {
        if is_special_key(key) {
            return self.handler.on_change(ct, key, None).await.map(|_| ());
        }
        let (ns, name) = key_parse(key);
        let obj = self.informer.get(&ns, &name);
        self.handler.on_change(ct, key, obj).await.map(|_| ())
    }

    async fn process_single_item(&self, ct: &CancellationToken, queue: &Arc<WorkQueue>, key: String) {
        let start = tokio::time::Instant::now();
        let result = std::panic::AssertUnwindSafe(self.sync(ct, &key)).catch_unwind().await;
        histogram!("reconcile_duration_ms", start.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(Ok(())) => {
                counter!("dispatch_total", 1u64);
                queue.forget(&key);
            }
            Ok(Err(err)) => {
                counter!("dispatch_errors_total", 1u64);
                if is_conflict(&err) {
                    debug!(controller = %self.name, key = %key, error = %err, "conflict syncing; requeuing");
                } else {
                    let chain = format!("{err:#}");
                    error!(controller = %self.name, key = %key, error = %chain, "error syncing; requeuing");
                }
                counter!("queue_retries_total", 1u64);
                queue.add_rate_limited(&key);
            }
            Err(_) => {
                counter!("dispatch_panics_total", 1u64);
                error!(controller = %self.name, key = %key, "recovered panic in handler");
            }
        }
        queue.done(&key);
    }
}

/// One popper per queue; items run on spawned tasks bounded by a semaphore.
async fn run_queue(
    ctrl: Arc<Controller>,
    queue: Arc<WorkQueue>,
    ct: CancellationToken,
    workers: usize,
) {
    let sem = Arc::new(Semaphore::new(workers));
    while let Some(key) = queue.get().await {
        let permit = match sem.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        if queue.shutting_down() {
            queue.done(&key);
            break;
        }
        let ctrl = ctrl.clone();
        let queue = queue.clone();
        let ct = ct.clone();
        tokio::spawn(async move {
            let _permit = permit;
            ctrl.process_single_item(&ct, &queue, key).await;
        });
    }
    // wait for in-flight items before reporting this queue stopped
    let _ = sem.acquire_many(workers as u32).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rudder_core::Obj;
    use rudder_store::{MemoryStore, ObjectStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn kind() -> Kind {
        Kind::core("v1", "ConfigMap")
    }

    struct Recorder {
        calls: Mutex<Vec<(String, bool)>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl ChangeHandler for Recorder {
        async fn on_change(
            &self,
            _ct: &CancellationToken,
            key: &str,
            obj: Option<Obj>,
        ) -> anyhow::Result<Option<Obj>> {
            self.calls.lock().unwrap().push((key.to_string(), obj.is_some()));
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("transient");
            }
            Ok(obj)
        }
    }

    async fn settle(calls: &Mutex<Vec<(String, bool)>>, want: usize) {
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if calls.lock().unwrap().len() >= want {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_informer_events() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(Recorder { calls: Mutex::default(), fail_first: AtomicUsize::new(0) });
        let ctrl = Controller::new(
            kind(),
            Informer::new(kind(), store.clone()),
            handler.clone(),
            ControllerOptions::default(),
        );
        let ct = CancellationToken::new();
        ctrl.start(&ct, 2).await.unwrap();

        store.create(&Obj::new(kind(), "ns", "a")).await.unwrap();
        settle(&handler.calls, 1).await;
        let calls = handler.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("ns/a".to_string(), true)]);
        ct.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_on_error() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(Recorder { calls: Mutex::default(), fail_first: AtomicUsize::new(1) });
        let ctrl = Controller::new(
            kind(),
            Informer::new(kind(), store.clone()),
            handler.clone(),
            ControllerOptions::default(),
        );
        let ct = CancellationToken::new();
        ctrl.start(&ct, 2).await.unwrap();

        store.create(&Obj::new(kind(), "ns", "a")).await.unwrap();
        settle(&handler.calls, 2).await;
        let calls = handler.calls.lock().unwrap().clone();
        assert!(calls.len() >= 2, "expected a retry, got {calls:?}");
        ct.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn special_keys_skip_fetch() {
        let store = Arc::new(MemoryStore::new());
        store.create(&Obj::new(kind(), "ns", "a")).await.unwrap();
        let handler = Arc::new(Recorder { calls: Mutex::default(), fail_first: AtomicUsize::new(0) });
        let ctrl = Controller::new(
            kind(),
            Informer::new(kind(), store.clone()),
            handler.clone(),
            ControllerOptions::default(),
        );
        let ct = CancellationToken::new();
        ctrl.start(&ct, 2).await.unwrap();
        // the create event lands first
        settle(&handler.calls, 1).await;

        ctrl.enqueue_key("_t ns/a");
        settle(&handler.calls, 2).await;
        let calls = handler.calls.lock().unwrap().clone();
        assert!(calls.contains(&("_t ns/a".to_string(), false)));
        ct.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn pre_start_enqueues_flush() {
        let store = Arc::new(MemoryStore::new());
        store.create(&Obj::new(kind(), "ns", "a")).await.unwrap();
        let handler = Arc::new(Recorder { calls: Mutex::default(), fail_first: AtomicUsize::new(0) });
        let ctrl = Controller::new(
            kind(),
            Informer::new(kind(), store.clone()),
            handler.clone(),
            ControllerOptions::default(),
        );
        ctrl.enqueue("ns", "a");
        let ct = CancellationToken::new();
        ctrl.start(&ct, 1).await.unwrap();
        settle(&handler.calls, 1).await;
        assert!(!handler.calls.lock().unwrap().is_empty());
        ct.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn sharded_queues_cover_all_keys() {
        struct ByteSplitter;
        impl WorkerQueueSplitter for ByteSplitter {
            fn queues(&self) -> usize {
                2
            }
            fn split(&self, key: &str) -> usize {
                key.as_bytes().iter().map(|b| *b as usize).sum::<usize>() % 2
            }
        }

        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(Recorder { calls: Mutex::default(), fail_first: AtomicUsize::new(0) });
        let ctrl = Controller::new(
            kind(),
            Informer::new(kind(), store.clone()),
            handler.clone(),
            ControllerOptions { splitter: Some(Arc::new(ByteSplitter)), ..Default::default() },
        );
        let ct = CancellationToken::new();
        ctrl.start(&ct, 4).await.unwrap();

        for name in ["a", "b", "c", "d"] {
            store.create(&Obj::new(kind(), "ns", name)).await.unwrap();
        }
        settle(&handler.calls, 4).await;
        let mut keys: Vec<String> =
            handler.calls.lock().unwrap().iter().map(|(k, _)| k.clone()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys, vec!["ns/a", "ns/b", "ns/c", "ns/d"]);
        ct.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn panics_do_not_kill_workers() {
        struct Panicker {
            count: AtomicUsize,
        }
        #[async_trait]
        impl ChangeHandler for Panicker {
            async fn on_change(
                &self,
                _ct: &CancellationToken,
                _key: &str,
                obj: Option<Obj>,
            ) -> anyhow::Result<Option<Obj>> {
                if self.count.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("boom");
                }
                Ok(obj)
            }
        }

        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(Panicker { count: AtomicUsize::new(0) });
        let ctrl = Controller::new(
            kind(),
            Informer::new(kind(), store.clone()),
            handler.clone(),
            ControllerOptions::default(),
        );
        let ct = CancellationToken::new();
        ctrl.start(&ct, 1).await.unwrap();

        store.create(&Obj::new(kind(), "ns", "a")).await.unwrap();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if handler.count.load(Ordering::SeqCst) >= 1 {
                break;
            }
        }
        // worker survives and handles the next key
        store.create(&Obj::new(kind(), "ns", "b")).await.unwrap();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if handler.count.load(Ordering::SeqCst) >= 2 {
                break;
            }
        }
        assert!(handler.count.load(Ordering::SeqCst) >= 2);
        ct.cancel();
    }
}
