//! In-memory object store with broadcast watch streams.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rudder_core::{key_for, Kind, Obj};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::{ListOptions, ObjEvent, ObjectStore, StoreError, StoreResult};

const WATCH_CAPACITY: usize = 1024;

struct KindState {
    objects: BTreeMap<String, Obj>,
    events: broadcast::Sender<ObjEvent>,
}

impl KindState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self { objects: BTreeMap::new(), events }
    }
}

/// A complete in-process [`ObjectStore`].
///
/// Resource versions are drawn from one monotonic counter across all kinds,
/// so version ordering is total. Every mutation is broadcast on the kind's
/// watch stream after the state change commits.
pub struct MemoryStore {
    kinds: Mutex<BTreeMap<Kind, KindState>>,
    rv: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { kinds: Mutex::new(BTreeMap::new()), rv: AtomicU64::new(0) }
    }

    fn next_rv(&self) -> String {
        self.rv.fetch_add(1, Ordering::SeqCst).wrapping_add(1).to_string()
    }

    fn not_found(kind: &Kind, namespace: &str, name: &str) -> StoreError {
        StoreError::NotFound(format!("{} {}", kind, key_for(namespace, name)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn publish(state: &KindState, event: ObjEvent) {
    // no receivers is fine; watch streams are optional
    let _ = state.events.send(event);
}

/// RFC 7386 merge: objects merge recursively, null deletes, anything else
/// replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            let map = target.as_object_mut().unwrap();
            for (k, v) in fields {
                if v.is_null() {
                    map.remove(k);
                } else {
                    merge_patch(map.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: &Kind, namespace: &str, name: &str) -> StoreResult<Obj> {
        let kinds = self.kinds.lock().unwrap();
        kinds
            .get(kind)
            .and_then(|s| s.objects.get(&key_for(namespace, name)))
            .cloned()
            .ok_or_else(|| Self::not_found(kind, namespace, name))
    }

    async fn list(&self, kind: &Kind, opts: &ListOptions) -> StoreResult<Vec<Obj>> {
        let kinds = self.kinds.lock().unwrap();
        Ok(kinds
            .get(kind)
            .map(|s| s.objects.values().filter(|o| opts.matches(o)).cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, obj: &Obj) -> StoreResult<Obj> {
        if obj.meta.name.is_empty() {
            return Err(StoreError::Invalid("object has no name".into()));
        }
        let mut kinds = self.kinds.lock().unwrap();
        let state = kinds.entry(obj.meta.kind.clone()).or_insert_with(KindState::new);
        let key = obj.key();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("{} {}", obj.meta.kind, key)));
        }
        let mut stored = obj.clone();
        stored.meta.uid = Uuid::new_v4().to_string();
        stored.meta.resource_version = self.next_rv();
        stored.meta.creation_timestamp = Some(Utc::now());
        stored.meta.deletion_timestamp = None;
        state.objects.insert(key, stored.clone());
        publish(state, ObjEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, obj: &Obj) -> StoreResult<Obj> {
        let mut kinds = self.kinds.lock().unwrap();
        let state = kinds
            .get_mut(&obj.meta.kind)
            .ok_or_else(|| Self::not_found(&obj.meta.kind, &obj.meta.namespace, &obj.meta.name))?;
        let key = obj.key();
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| Self::not_found(&obj.meta.kind, &obj.meta.namespace, &obj.meta.name))?;
        if current.meta.resource_version != obj.meta.resource_version {
            return Err(StoreError::Conflict(format!("{} {}", obj.meta.kind, key)));
        }

        let mut stored = obj.clone();
        stored.meta.uid = current.meta.uid.clone();
        stored.meta.creation_timestamp = current.meta.creation_timestamp;
        stored.meta.deletion_timestamp = current.meta.deletion_timestamp;
        stored.status = current.status.clone();
        stored.meta.resource_version = self.next_rv();

        if stored.meta.deletion_timestamp.is_some() && stored.meta.finalizers.is_empty() {
            // last finalizer cleared on a deleting object: purge it
            state.objects.remove(&key);
            publish(state, ObjEvent::Deleted(stored.clone()));
            debug!(kind = %stored.meta.kind, key = %key, "finalized object purged");
            return Ok(stored);
        }

        state.objects.insert(key, stored.clone());
        publish(state, ObjEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn update_status(&self, obj: &Obj) -> StoreResult<Obj> {
        let mut kinds = self.kinds.lock().unwrap();
        let state = kinds
            .get_mut(&obj.meta.kind)
            .ok_or_else(|| Self::not_found(&obj.meta.kind, &obj.meta.namespace, &obj.meta.name))?;
        let key = obj.key();
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| Self::not_found(&obj.meta.kind, &obj.meta.namespace, &obj.meta.name))?;
        if current.meta.resource_version != obj.meta.resource_version {
            return Err(StoreError::Conflict(format!("{} {}", obj.meta.kind, key)));
        }

        let mut stored = current.clone();
        stored.status = obj.status.clone();
        stored.meta.resource_version = self.next_rv();
        state.objects.insert(key, stored.clone());
        publish(state, ObjEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn patch(
        &self,
        kind: &Kind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> StoreResult<Obj> {
        let mut kinds = self.kinds.lock().unwrap();
        let state = kinds.get_mut(kind).ok_or_else(|| Self::not_found(kind, namespace, name))?;
        let key = key_for(namespace, name);
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| Self::not_found(kind, namespace, name))?;

        let mut raw = serde_json::to_value(current)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        merge_patch(&mut raw, patch);
        let mut patched: Obj =
            serde_json::from_value(raw).map_err(|e| StoreError::Invalid(e.to_string()))?;

        // identity is not patchable
        patched.meta.kind = current.meta.kind.clone();
        patched.meta.namespace = current.meta.namespace.clone();
        patched.meta.name = current.meta.name.clone();
        patched.meta.uid = current.meta.uid.clone();
        patched.meta.creation_timestamp = current.meta.creation_timestamp;
        patched.meta.deletion_timestamp = current.meta.deletion_timestamp;
        patched.meta.resource_version = self.next_rv();

        state.objects.insert(key, patched.clone());
        publish(state, ObjEvent::Applied(patched.clone()));
        Ok(patched)
    }

    async fn delete(&self, kind: &Kind, namespace: &str, name: &str) -> StoreResult<()> {
        let mut kinds = self.kinds.lock().unwrap();
        let state = kinds.get_mut(kind).ok_or_else(|| Self::not_found(kind, namespace, name))?;
        let key = key_for(namespace, name);
        let current = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Self::not_found(kind, namespace, name))?;

        if !current.meta.finalizers.is_empty() {
            if current.meta.deletion_timestamp.is_none() {
                current.meta.deletion_timestamp = Some(Utc::now());
                current.meta.resource_version = self.next_rv();
                let updated = current.clone();
                publish(state, ObjEvent::Applied(updated));
            }
            return Ok(());
        }

        if let Some(removed) = state.objects.remove(&key) {
            publish(state, ObjEvent::Deleted(removed));
        }
        Ok(())
    }

    async fn delete_all_of(&self, kind: &Kind, opts: &ListOptions) -> StoreResult<usize> {
        let victims: Vec<Obj> = self.list(kind, opts).await?;
        let mut removed = 0;
        for obj in victims {
            match self.delete(kind, &obj.meta.namespace, &obj.meta.name).await {
                Ok(()) => removed += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    fn watch(&self, kind: &Kind) -> broadcast::Receiver<ObjEvent> {
        let mut kinds = self.kinds.lock().unwrap();
        kinds.entry(kind.clone()).or_insert_with(KindState::new).events.subscribe()
    }
}
