//! Write-through recent-object cache over the store.
//!
//! Informer-backed reads can trail a write this process just made. Every
//! successful mutation is remembered for a short window, and reads prefer
//! the remembered copy whenever the cached view is missing or older.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rudder_core::{newer, Kind, Obj};
use rudder_store::{ListOptions, ObjEvent, ObjectStore, StoreResult};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// How long a freshly written object shadows the informer view.
pub const RECENT_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObjectKey {
    kind: Kind,
    namespace: String,
    name: String,
}

impl ObjectKey {
    fn of(obj: &Obj) -> Self {
        Self {
            kind: obj.meta.kind.clone(),
            namespace: obj.meta.namespace.clone(),
            name: obj.meta.name.clone(),
        }
    }
}

struct RecentEntry {
    obj: Obj,
    inserted: Instant,
}

/// Reads that may be served from a per-kind informer cache.
#[async_trait]
pub trait CachedReader: Send + Sync {
    async fn get(&self, kind: &Kind, namespace: &str, name: &str) -> StoreResult<Obj>;
    async fn list(&self, kind: &Kind, opts: &ListOptions) -> StoreResult<Vec<Obj>>;
}

/// The client handed to reconciles: cached reads reconciled against recent
/// writes, and mutations that feed the recent map.
pub struct CacheClient {
    store: Arc<dyn ObjectStore>,
    cached: Arc<dyn CachedReader>,
    recent: Mutex<FxHashMap<ObjectKey, RecentEntry>>,
    purge_started: AtomicBool,
}

impl CacheClient {
    pub fn new(store: Arc<dyn ObjectStore>, cached: Arc<dyn CachedReader>) -> Arc<Self> {
        Arc::new(Self {
            store,
            cached,
            recent: Mutex::new(FxHashMap::default()),
            purge_started: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Idempotent; runs until cancelled.
    pub fn start_purge(self: &Arc<Self>, ct: &CancellationToken) {
        if self.purge_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let ct = ct.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ct.cancelled() => return,
                    _ = tokio::time::sleep(RECENT_TTL) => {}
                }
                let now = Instant::now();
                let mut recent = this.recent.lock().unwrap();
                recent.retain(|_, v| now.duration_since(v.inserted) < RECENT_TTL);
            }
        });
    }

    fn remember(&self, obj: &Obj) {
        trace!(kind = %obj.meta.kind, key = %obj.key(), rv = %obj.meta.resource_version, "recent store");
        self.recent.lock().unwrap().insert(
            ObjectKey::of(obj),
            RecentEntry { obj: obj.clone(), inserted: Instant::now() },
        );
    }

    fn evict(&self, kind: &Kind, namespace: &str, name: &str) {
        self.recent.lock().unwrap().remove(&ObjectKey {
            kind: kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }

    fn recent_copy(&self, kind: &Kind, namespace: &str, name: &str) -> Option<Obj> {
        let recent = self.recent.lock().unwrap();
        recent
            .get(&ObjectKey {
                kind: kind.clone(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .filter(|e| e.inserted.elapsed() < RECENT_TTL)
            .map(|e| e.obj.clone())
    }

    pub async fn get(&self, kind: &Kind, namespace: &str, name: &str) -> StoreResult<Obj> {
        let got = self.cached.get(kind, namespace, name).await;
        let recent = self.recent_copy(kind, namespace, name);
        match got {
            Err(e) if e.is_not_found() => recent.ok_or(e),
            Err(e) => Err(e),
            Ok(obj) => match recent {
                Some(r) if newer(&obj.meta.resource_version, &r.meta.resource_version) => Ok(r),
                _ => Ok(obj),
            },
        }
    }

    pub async fn get_uncached(&self, kind: &Kind, namespace: &str, name: &str) -> StoreResult<Obj> {
        self.store.get(kind, namespace, name).await
    }

    pub async fn list(&self, kind: &Kind, opts: &ListOptions) -> StoreResult<Vec<Obj>> {
        self.cached.list(kind, opts).await
    }

    pub async fn list_uncached(&self, kind: &Kind, opts: &ListOptions) -> StoreResult<Vec<Obj>> {
        self.store.list(kind, opts).await
    }

    pub async fn create(&self, obj: &Obj) -> StoreResult<Obj> {
        let stored = self.store.create(obj).await?;
        self.remember(&stored);
        Ok(stored)
    }

    pub async fn update(&self, obj: &Obj) -> StoreResult<Obj> {
        let stored = self.store.update(obj).await?;
        self.remember(&stored);
        Ok(stored)
    }

    pub async fn update_status(&self, obj: &Obj) -> StoreResult<Obj> {
        let stored = self.store.update_status(obj).await?;
        self.remember(&stored);
        Ok(stored)
    }

    pub async fn patch(
        &self,
        kind: &Kind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> StoreResult<Obj> {
        let stored = self.store.patch(kind, namespace, name, patch).await?;
        self.remember(&stored);
        Ok(stored)
    }

    pub async fn delete(&self, kind: &Kind, namespace: &str, name: &str) -> StoreResult<()> {
        self.store.delete(kind, namespace, name).await?;
        self.evict(kind, namespace, name);
        Ok(())
    }

    pub async fn delete_all_of(&self, kind: &Kind, opts: &ListOptions) -> StoreResult<usize> {
        self.store.delete_all_of(kind, opts).await
    }

    pub fn watch(&self, kind: &Kind) -> broadcast::Receiver<ObjEvent> {
        self.store.watch(kind)
    }
}
