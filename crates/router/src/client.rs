//! The read/write facade handlers see.
//!
//! Reads subscribe the current reconcile to the read target before being
//! served through the recent-write cache. The `uncached()` and
//! `untriggered()` views opt out of one behavior each and compose.

use std::sync::Arc;

use rudder_core::{FieldSelector, Kind, LabelSelector, Obj};
use rudder_runtime::CacheClient;
use rudder_store::{ListOptions, ObjEvent, StoreError, StoreResult};
use tokio::sync::broadcast;

use crate::triggers::RequestTriggers;

#[derive(Clone)]
pub struct Client {
    cache: Arc<CacheClient>,
    registry: Arc<RequestTriggers>,
    triggered: bool,
    uncached: bool,
}

impl Client {
    pub(crate) fn new(cache: Arc<CacheClient>, registry: Arc<RequestTriggers>) -> Self {
        Self { cache, registry, triggered: true, uncached: false }
    }

    /// Reads bypass the recent-write cache and hit the store directly.
    pub fn uncached(&self) -> Client {
        Client { uncached: true, ..self.clone() }
    }

    /// Reads do not register trigger subscriptions.
    pub fn untriggered(&self) -> Client {
        Client { triggered: false, ..self.clone() }
    }

    async fn subscribe(
        &self,
        kind: &Kind,
        namespace: &str,
        name: &str,
        selector: &LabelSelector,
        fields: &FieldSelector,
    ) -> StoreResult<()> {
        if !self.triggered {
            return Ok(());
        }
        self.registry
            .watch(kind, namespace, name, selector, fields)
            .await
            .map_err(|e| StoreError::Internal(format!("registering watch on {kind}: {e}")))
    }

    pub async fn get(&self, kind: &Kind, namespace: &str, name: &str) -> StoreResult<Obj> {
        self.subscribe(
            kind,
            namespace,
            name,
            &LabelSelector::everything(),
            &FieldSelector::everything(),
        )
        .await?;
        if self.uncached {
            self.cache.get_uncached(kind, namespace, name).await
        } else {
            self.cache.get(kind, namespace, name).await
        }
    }

    pub async fn list(&self, kind: &Kind, opts: &ListOptions) -> StoreResult<Vec<Obj>> {
        self.subscribe(
            kind,
            opts.namespace.as_deref().unwrap_or(""),
            "",
            &opts.label_selector,
            &opts.field_selector,
        )
        .await?;
        if self.uncached {
            self.cache.list_uncached(kind, opts).await
        } else {
            self.cache.list(kind, opts).await
        }
    }

    pub async fn create(&self, obj: &Obj) -> StoreResult<Obj> {
        self.cache.create(obj).await
    }

    pub async fn update(&self, obj: &Obj) -> StoreResult<Obj> {
        self.cache.update(obj).await
    }

    pub async fn update_status(&self, obj: &Obj) -> StoreResult<Obj> {
        self.cache.update_status(obj).await
    }

    pub async fn patch(
        &self,
        kind: &Kind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> StoreResult<Obj> {
        self.cache.patch(kind, namespace, name, patch).await
    }

    pub async fn delete(&self, kind: &Kind, namespace: &str, name: &str) -> StoreResult<()> {
        self.cache.delete(kind, namespace, name).await
    }

    pub async fn delete_all_of(&self, kind: &Kind, opts: &ListOptions) -> StoreResult<usize> {
        self.cache.delete_all_of(kind, opts).await
    }

    /// Raw change stream; never cached.
    pub fn watch(&self, kind: &Kind) -> broadcast::Receiver<ObjEvent> {
        self.cache.watch(kind)
    }
}
