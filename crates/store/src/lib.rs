//! Rudder object store: the typed CRUD + list/watch surface the runtime
//! drives, plus an in-memory reference implementation.

#![forbid(unsafe_code)]

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use rudder_core::{FieldSelector, Kind, LabelSelector, Obj};
use thiserror::Error;
use tokio::sync::broadcast;

/// Store errors suitable for matching by the runtime.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}: apply your changes to the latest version and retry")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A change event on a kind's watch stream.
#[derive(Debug, Clone)]
pub enum ObjEvent {
    /// Created or updated; carries the stored object.
    Applied(Obj),
    /// Removed; carries the last stored state.
    Deleted(Obj),
}

impl ObjEvent {
    pub fn obj(&self) -> &Obj {
        match self {
            ObjEvent::Applied(o) | ObjEvent::Deleted(o) => o,
        }
    }
}

/// Scope and filters for list/delete-collection calls.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// None lists across all namespaces.
    pub namespace: Option<String>,
    pub label_selector: LabelSelector,
    pub field_selector: FieldSelector,
}

impl ListOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), ..Self::default() }
    }

    pub fn matches(&self, obj: &Obj) -> bool {
        if let Some(ns) = &self.namespace {
            if &obj.meta.namespace != ns {
                return false;
            }
        }
        self.label_selector.matches(&obj.meta.labels) && self.field_selector.matches(obj)
    }
}

/// Typed object store with per-kind watch streams.
///
/// Writes use optimistic concurrency: `update`/`update_status` fail with
/// [`StoreError::Conflict`] when the submitted resource version is stale.
/// `delete` on an object holding finalizers marks it deleting instead of
/// removing it; the removal happens when the last finalizer is cleared.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: &Kind, namespace: &str, name: &str) -> StoreResult<Obj>;

    async fn list(&self, kind: &Kind, opts: &ListOptions) -> StoreResult<Vec<Obj>>;

    /// Persist a new object; uid, resource version and creation timestamp are
    /// assigned by the store. Returns the stored form.
    async fn create(&self, obj: &Obj) -> StoreResult<Obj>;

    /// Replace spec and metadata; status is left untouched.
    async fn update(&self, obj: &Obj) -> StoreResult<Obj>;

    /// Replace status only.
    async fn update_status(&self, obj: &Obj) -> StoreResult<Obj>;

    /// JSON merge patch against the object's serialized form.
    async fn patch(
        &self,
        kind: &Kind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> StoreResult<Obj>;

    async fn delete(&self, kind: &Kind, namespace: &str, name: &str) -> StoreResult<()>;

    async fn delete_all_of(&self, kind: &Kind, opts: &ListOptions) -> StoreResult<usize>;

    /// Subscribe to the kind's change stream. Subscribing before the first
    /// write is valid. Receivers that fall behind observe a lag error and are
    /// expected to relist.
    fn watch(&self, kind: &Kind) -> broadcast::Receiver<ObjEvent>;
}
