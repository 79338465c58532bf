//! Per-kind informer: a local cache kept current by the store's watch
//! stream, with registered event callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::counter;
use rudder_core::{key_for, newer, Kind, Obj};
use rudder_store::{ListOptions, ObjEvent, ObjectStore};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::RuntimeError;

const RESYNC_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const RESYNC_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum InformerEvent {
    Added(Obj),
    Updated(Obj),
    Deleted(Obj),
}

impl InformerEvent {
    pub fn obj(&self) -> &Obj {
        match self {
            InformerEvent::Added(o) | InformerEvent::Updated(o) | InformerEvent::Deleted(o) => o,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&InformerEvent) + Send + Sync>;

/// Change-data-capture cache for one kind.
///
/// The cache never replaces an entry with an older resource version, so a
/// relist racing the live stream cannot move the view backwards.
pub struct Informer {
    kind: Kind,
    store: Arc<dyn ObjectStore>,
    cache: RwLock<FxHashMap<String, Obj>>,
    handlers: RwLock<Vec<EventHandler>>,
    synced: AtomicBool,
    sync_notify: Notify,
    started: AtomicBool,
}

impl Informer {
    pub fn new(kind: Kind, store: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            store,
            cache: RwLock::new(FxHashMap::default()),
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
            sync_notify: Notify::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn add_event_handler(&self, handler: EventHandler) {
        self.handlers.write().unwrap().push(handler);
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Obj> {
        self.cache.read().unwrap().get(&key_for(namespace, name)).cloned()
    }

    pub fn list(&self) -> Vec<Obj> {
        self.cache.read().unwrap().values().cloned().collect()
    }

    /// Idempotent; spawns the watch loop.
    pub fn start(self: &Arc<Self>, ct: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.run(ct).await });
    }

    pub async fn wait_for_sync(&self, ct: &CancellationToken) -> Result<(), RuntimeError> {
        loop {
            let notified = self.sync_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.has_synced() {
                return Ok(());
            }
            tokio::select! {
                _ = ct.cancelled() => return Err(RuntimeError::Cancelled),
                _ = notified => {}
            }
        }
    }

    async fn run(self: Arc<Self>, ct: CancellationToken) {
        let mut backoff = RESYNC_BACKOFF_INITIAL;
        info!(kind = %self.kind, "informer starting");
        loop {
            // subscribe before listing so nothing lands between the two
            let mut rx = self.store.watch(&self.kind);

            if let Err(e) = self.resync().await {
                warn!(kind = %self.kind, error = %e, "informer list failed; backing off");
                tokio::select! {
                    _ = ct.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(RESYNC_BACKOFF_MAX);
                continue;
            }
            backoff = RESYNC_BACKOFF_INITIAL;
            self.synced.store(true, Ordering::SeqCst);
            self.sync_notify.notify_waiters();

            loop {
                tokio::select! {
                    _ = ct.cancelled() => {
                        debug!(kind = %self.kind, "informer stopping");
                        return;
                    }
                    ev = rx.recv() => match ev {
                        Ok(ObjEvent::Applied(obj)) => self.apply(obj),
                        Ok(ObjEvent::Deleted(obj)) => self.remove(&obj),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(kind = %self.kind, skipped, "watch stream lagged; relisting");
                            counter!("informer_relist_total", 1u64);
                            if let Err(e) = self.resync().await {
                                warn!(kind = %self.kind, error = %e, "relist after lag failed");
                            }
                        }
                        Err(RecvError::Closed) => {
                            warn!(kind = %self.kind, "watch stream closed; restarting");
                            counter!("informer_restarts_total", 1u64);
                            tokio::select! {
                                _ = ct.cancelled() => return,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(RESYNC_BACKOFF_MAX);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Full list: applies every live object and synthesizes deletes for
    /// cached entries the store no longer has.
    async fn resync(&self) -> Result<(), RuntimeError> {
        let objs = self.store.list(&self.kind, &ListOptions::default()).await?;
        let live: FxHashSet<String> = objs.iter().map(|o| o.key()).collect();
        for obj in objs {
            self.apply(obj);
        }
        let stale: Vec<Obj> = {
            let cache = self.cache.read().unwrap();
            cache
                .iter()
                .filter(|(k, _)| !live.contains(k.as_str()))
                .map(|(_, o)| o.clone())
                .collect()
        };
        for obj in stale {
            self.remove(&obj);
        }
        Ok(())
    }

    fn apply(&self, obj: Obj) {
        let key = obj.key();
        let event = {
            let mut cache = self.cache.write().unwrap();
            match cache.get(&key) {
                Some(existing)
                    if !newer(&existing.meta.resource_version, &obj.meta.resource_version) =>
                {
                    return;
                }
                Some(_) => {
                    cache.insert(key, obj.clone());
                    InformerEvent::Updated(obj)
                }
                None => {
                    cache.insert(key, obj.clone());
                    InformerEvent::Added(obj)
                }
            }
        };
        self.dispatch(&event);
    }

    fn remove(&self, obj: &Obj) {
        let removed = self.cache.write().unwrap().remove(&obj.key());
        if let Some(last) = removed {
            self.dispatch(&InformerEvent::Deleted(last));
        }
    }

    fn dispatch(&self, event: &InformerEvent) {
        let handlers: Vec<EventHandler> = self.handlers.read().unwrap().clone();
        for h in handlers {
            h(event);
        }
    }
}
