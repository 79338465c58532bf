//! The request/response contract between the dispatch engine and handlers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rudder_core::{Kind, Obj};
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::triggers::RequestTriggers;

/// One reconcile's view of the world.
///
/// `object` is None iff the store says the object no longer exists. Handlers
/// mutate `object` in place; the engine persists observable changes after
/// the chain completes.
pub struct Request {
    pub ct: CancellationToken,
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
    pub key: String,
    pub object: Option<Obj>,
    /// True when this dispatch was caused by a watched dependency changing
    /// rather than by an own-object event.
    pub from_trigger: bool,
    pub client: Client,
}

pub struct Response {
    delay: Duration,
    attributes: BTreeMap<String, serde_json::Value>,
    registry: Arc<RequestTriggers>,
}

impl Response {
    pub(crate) fn new(registry: Arc<RequestTriggers>) -> Self {
        Self { delay: Duration::ZERO, attributes: BTreeMap::new(), registry }
    }

    /// Requests a re-enqueue after `delay`. Multiple calls keep the minimum;
    /// zero is a no-op.
    pub fn retry_after(&mut self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        if self.delay.is_zero() || delay < self.delay {
            self.delay = delay;
        }
    }

    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }

    /// Free-form per-reconcile scratch space.
    pub fn attributes(&mut self) -> &mut BTreeMap<String, serde_json::Value> {
        &mut self.attributes
    }

    /// Kinds this reconcile has subscribed to so far.
    pub fn watching(&self) -> Vec<Kind> {
        self.registry.watching()
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()>;
}

/// Adapts a closure returning a boxed future into a [`Handler`].
///
/// ```ignore
/// let h = handler_fn(|req, _resp| {
///     Box::pin(async move {
///         let _ = &req.object;
///         Ok(())
///     })
/// });
/// ```
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync
        + 'static,
{
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        (self.0)(req, resp).await
    }
}

/// Router-level error hook. Returning None marks the error handled; the
/// engine then continues with save-on-change.
pub type ErrorCallback =
    Arc<dyn Fn(&Request, &Response, Option<anyhow::Error>) -> Option<anyhow::Error> + Send + Sync>;
