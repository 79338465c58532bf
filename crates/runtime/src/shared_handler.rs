//! Ordered, named handler chain shared by everything watching a kind.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rudder_core::{Kind, Obj};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::errors::{is_ignore, ErrorList, HandlerError};
use crate::ChangeHandler;

struct HandlerEntry {
    id: i64,
    name: String,
    handler: Arc<dyn ChangeHandler>,
}

/// Registration-ordered chain. Each entry may return a replacement object,
/// which later entries then observe.
pub struct SharedHandler {
    kind: Kind,
    id_counter: AtomicI64,
    entries: RwLock<Vec<HandlerEntry>>,
}

impl SharedHandler {
    pub fn new(kind: Kind) -> Arc<Self> {
        Arc::new(Self { kind, id_counter: AtomicI64::new(0), entries: RwLock::new(Vec::new()) })
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// The entry is removed when `ct` is cancelled.
    pub fn register(self: &Arc<Self>, ct: &CancellationToken, name: &str, handler: Arc<dyn ChangeHandler>) {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.write().unwrap().push(HandlerEntry {
            id,
            name: name.to_string(),
            handler,
        });

        let this = Arc::downgrade(self);
        let ct = ct.clone();
        tokio::spawn(async move {
            ct.cancelled().await;
            if let Some(shared) = this.upgrade() {
                shared.entries.write().unwrap().retain(|e| e.id != id);
            }
        });
    }

    pub fn has_handlers(&self) -> bool {
        !self.entries.read().unwrap().is_empty()
    }
}

#[async_trait]
impl ChangeHandler for SharedHandler {
    async fn on_change(
        &self,
        ct: &CancellationToken,
        key: &str,
        obj: Option<Obj>,
    ) -> anyhow::Result<Option<Obj>> {
        let entries: Vec<(String, Arc<dyn ChangeHandler>)> = {
            let entries = self.entries.read().unwrap();
            entries.iter().map(|e| (e.name.clone(), e.handler.clone())).collect()
        };

        let mut obj = obj;
        let mut errs = ErrorList::default();
        for (name, handler) in entries {
            trace!(kind = %self.kind, key = %key, handler = %name, "invoking");
            match handler.on_change(ct, key, obj.clone()).await {
                Ok(Some(new_obj)) => {
                    // an object without persisted identity only replaces nothing
                    if !new_obj.meta.uid.is_empty() || obj.is_none() {
                        obj = Some(new_obj);
                    }
                }
                Ok(None) => {}
                Err(err) if is_ignore(&err) => {}
                Err(err) => errs.push(HandlerError { handler: name, source: err }),
            }
        }
        errs.into_result(obj)
    }
}
