//! Wires informers, controllers, and the cached client into one backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rudder_core::{Kind, Obj};
use rudder_store::{ListOptions, ObjectStore, StoreError, StoreResult};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cached::{CacheClient, CachedReader};
use crate::controller::{Controller, ControllerOptions};
use crate::informer::Informer;
use crate::shared_handler::SharedHandler;
use crate::{env_usize, ChangeHandler, RuntimeError};

const DEFAULT_WORKERS: usize = 4;

/// Lazily created informers, one per kind, doubling as the cached read path.
pub struct InformerSet {
    store: Arc<dyn ObjectStore>,
    informers: Mutex<FxHashMap<Kind, Arc<Informer>>>,
}

impl InformerSet {
    pub fn new(store: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self { store, informers: Mutex::new(FxHashMap::default()) })
    }

    pub fn get_or_create(&self, kind: &Kind) -> Arc<Informer> {
        let mut informers = self.informers.lock().unwrap();
        informers
            .entry(kind.clone())
            .or_insert_with(|| Informer::new(kind.clone(), self.store.clone()))
            .clone()
    }

    pub fn get(&self, kind: &Kind) -> Option<Arc<Informer>> {
        self.informers.lock().unwrap().get(kind).cloned()
    }
}

#[async_trait]
impl CachedReader for InformerSet {
    async fn get(&self, kind: &Kind, namespace: &str, name: &str) -> StoreResult<Obj> {
        match self.get(kind) {
            Some(informer) if informer.has_synced() => {
                informer.get(namespace, name).ok_or_else(|| {
                    StoreError::NotFound(format!(
                        "{} {}",
                        kind,
                        rudder_core::key_for(namespace, name)
                    ))
                })
            }
            _ => self.store.get(kind, namespace, name).await,
        }
    }

    async fn list(&self, kind: &Kind, opts: &ListOptions) -> StoreResult<Vec<Obj>> {
        match self.get(kind) {
            Some(informer) if informer.has_synced() => {
                Ok(informer.list().into_iter().filter(|o| opts.matches(o)).collect())
            }
            _ => self.store.list(kind, opts).await,
        }
    }
}

#[derive(Clone)]
struct ControllerEntry {
    controller: Arc<Controller>,
    shared: Arc<SharedHandler>,
}

#[derive(Default)]
struct BackendState {
    controllers: FxHashMap<Kind, ControllerEntry>,
    /// Present once the backend has started; late watchers start immediately.
    run_ct: Option<CancellationToken>,
}

/// The store-facing runtime: per-kind controllers fed by informers, a
/// trigger entry point, and the recent-write cached client.
pub struct RuntimeBackend {
    store: Arc<dyn ObjectStore>,
    informers: Arc<InformerSet>,
    client: Arc<CacheClient>,
    workers: usize,
    state: Mutex<BackendState>,
}

impl RuntimeBackend {
    pub fn new(store: Arc<dyn ObjectStore>) -> Arc<Self> {
        Self::with_workers(store, env_usize("RUDDER_WORKERS", DEFAULT_WORKERS))
    }

    pub fn with_workers(store: Arc<dyn ObjectStore>, workers: usize) -> Arc<Self> {
        let informers = InformerSet::new(store.clone());
        let client = CacheClient::new(store.clone(), informers.clone());
        Arc::new(Self { store, informers, client, workers: workers.max(1), state: Mutex::new(BackendState::default()) })
    }

    pub fn client(&self) -> Arc<CacheClient> {
        self.client.clone()
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub fn controller(&self, kind: &Kind) -> Option<Arc<Controller>> {
        self.state.lock().unwrap().controllers.get(kind).map(|e| e.controller.clone())
    }

    /// Registers `handler` on the kind's shared chain, creating the
    /// controller on first use. Watchers added after start are started
    /// immediately.
    pub async fn watcher(
        &self,
        ct: &CancellationToken,
        kind: &Kind,
        name: &str,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<(), RuntimeError> {
        let (entry, run_ct) = {
            let mut st = self.state.lock().unwrap();
            let entry = st
                .controllers
                .entry(kind.clone())
                .or_insert_with(|| {
                    debug!(kind = %kind, "creating controller");
                    let informer = self.informers.get_or_create(kind);
                    let shared = SharedHandler::new(kind.clone());
                    let controller = Controller::new(
                        kind.clone(),
                        informer,
                        shared.clone(),
                        ControllerOptions::default(),
                    );
                    ControllerEntry { controller, shared }
                })
                .clone();
            (entry, st.run_ct.clone())
        };

        entry.shared.register(ct, name, handler);
        if let Some(run_ct) = run_ct {
            entry.controller.start(&run_ct, self.workers).await?;
        }
        Ok(())
    }

    /// Injects a synthetic event into the kind's queue.
    pub async fn trigger(
        &self,
        kind: &Kind,
        key: &str,
        delay: Duration,
    ) -> Result<(), RuntimeError> {
        match self.controller(kind) {
            Some(controller) => {
                controller.enqueue_key_after(key, delay);
                Ok(())
            }
            None => Err(RuntimeError::UnknownKind(kind.clone())),
        }
    }

    /// Starts every registered controller and the recent-cache purger.
    pub async fn start(&self, ct: &CancellationToken) -> Result<(), RuntimeError> {
        let entries: Vec<ControllerEntry> = {
            let mut st = self.state.lock().unwrap();
            st.run_ct = Some(ct.clone());
            st.controllers.values().cloned().collect()
        };
        for entry in entries {
            entry.controller.start(ct, self.workers).await?;
        }
        self.client.start_purge(ct);
        Ok(())
    }

    /// Read-only standby: syncs every informer without running workers.
    pub async fn preload(&self, ct: &CancellationToken) -> Result<(), RuntimeError> {
        let entries: Vec<ControllerEntry> = {
            let st = self.state.lock().unwrap();
            st.controllers.values().cloned().collect()
        };
        for entry in entries {
            let informer = entry.controller.informer();
            informer.start(ct.clone());
            informer.wait_for_sync(ct).await?;
        }
        self.client.start_purge(ct);
        Ok(())
    }

    /// Resolves once every started worker has drained.
    pub async fn stopped(&self) {
        let handles: Vec<_> = {
            let st = self.state.lock().unwrap();
            st.controllers.values().cloned().collect::<Vec<_>>()
        }
        .into_iter()
        .flat_map(|e| e.controller.take_worker_handles())
        .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
