//! Rudder runtime: per-kind controllers, informers, work queues, the shared
//! handler chain, and the write-through cached client.

#![forbid(unsafe_code)]

pub mod backend;
pub mod cached;
pub mod controller;
pub mod errors;
pub mod informer;
pub mod queue;
pub mod shared_handler;

pub use backend::{InformerSet, RuntimeBackend};
pub use cached::{CacheClient, CachedReader, RECENT_TTL};
pub use controller::{Controller, ControllerOptions, SingleQueueSplitter, WorkerQueueSplitter};
pub use errors::{is_conflict, is_ignore, ErrorList, HandlerError, Ignore};
pub use informer::{Informer, InformerEvent};
pub use queue::{default_controller_rate_limiter, RateLimiter, WorkQueue};
pub use shared_handler::SharedHandler;

use async_trait::async_trait;
use rudder_core::{Kind, Obj};
use rudder_store::StoreError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("informer for {0} failed to sync")]
    SyncFailed(Kind),
    #[error("no controller registered for {0}")]
    UnknownKind(Kind),
    #[error("cancelled")]
    Cancelled,
}

/// Callback a controller invokes for each dequeued key.
///
/// `obj` is None when the informer no longer holds the object, or when the
/// key carries a control marker (`_t `, `_r `) and the receiver is expected
/// to re-fetch. The returned object, if any, is the post-handler view.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn on_change(
        &self,
        ct: &CancellationToken,
        key: &str,
        obj: Option<Obj>,
    ) -> anyhow::Result<Option<Obj>>;
}

pub(crate) fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name).ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(default)
}
