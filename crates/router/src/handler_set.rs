//! The dispatch engine: key decoding, the rate-limit gate, per-key
//! serialization, chain invocation, subscription updates, and save.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use once_cell::sync::OnceCell;
use rudder_core::{key_parse, Kind, Obj};
use rudder_runtime::{is_ignore, ChangeHandler, ErrorList, HandlerError, RuntimeBackend};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Client;
use crate::locker::KeyLocker;
use crate::request::{ErrorCallback, Handler, Request, Response};
use crate::save;
use crate::triggers::{EnqueueTarget, RequestTriggers, Triggers};
use crate::RuntimeError;

/// Key marker: dispatch caused by a watched dependency changing.
pub const TRIGGER_PREFIX: &str = "_t ";
/// Key marker: replay scheduled by the rate-limit gate after backoff.
pub const REPLAY_PREFIX: &str = "_r ";

/// One token per five seconds per key, with room for a burst of ten. This
/// bounds how often a key's chain can run regardless of what produced the
/// pressure: change events, triggers, or error retries.
const KEY_REFILL_PER_SEC: f64 = 1.0 / 5.0;
const KEY_BURST: f64 = 10.0;

struct TokenBucket {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self { tokens: KEY_BURST, last: Instant::now() }
    }

    /// Reserves one token, going negative if none are available, and returns
    /// how long until the reservation is covered.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let refill = now.duration_since(self.last).as_secs_f64() * KEY_REFILL_PER_SEC;
        self.tokens = (self.tokens + refill).min(KEY_BURST);
        self.last = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / KEY_REFILL_PER_SEC)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LimiterKey {
    kind: Kind,
    key: String,
}

#[derive(Default)]
struct LimiterState {
    limiters: FxHashMap<LimiterKey, TokenBucket>,
    waiting: FxHashSet<LimiterKey>,
}

struct RouteEntry {
    name: String,
    handler: Arc<dyn Handler>,
}

/// Everything needed to dispatch one kind's events through its registered
/// route handlers.
pub struct HandlerSet {
    name: String,
    backend: Arc<RuntimeBackend>,
    handlers: Mutex<FxHashMap<Kind, Vec<RouteEntry>>>,
    triggers: Triggers,
    locker: Arc<KeyLocker>,
    limiters: Arc<Mutex<LimiterState>>,
    watching: tokio::sync::Mutex<FxHashSet<Kind>>,
    on_error: Mutex<Option<ErrorCallback>>,
    ct: OnceCell<CancellationToken>,
}

impl HandlerSet {
    pub fn new(name: impl Into<String>, backend: Arc<RuntimeBackend>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            triggers: Triggers::new(backend.clone()),
            backend,
            handlers: Mutex::new(FxHashMap::default()),
            locker: Arc::new(KeyLocker::new()),
            limiters: Arc::new(Mutex::new(LimiterState::default())),
            watching: tokio::sync::Mutex::new(FxHashSet::default()),
            on_error: Mutex::new(None),
            ct: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> Arc<RuntimeBackend> {
        self.backend.clone()
    }

    pub(crate) fn triggers(&self) -> &Triggers {
        &self.triggers
    }

    pub fn dump_triggers(&self, indent: bool) -> String {
        self.triggers.dump(indent)
    }

    pub(crate) fn set_error_callback(&self, cb: Option<ErrorCallback>) {
        *self.on_error.lock().unwrap() = cb;
    }

    pub fn add_handler(&self, route_name: &str, kind: &Kind, handler: Arc<dyn Handler>) {
        let mut handlers = self.handlers.lock().unwrap();
        handlers.entry(kind.clone()).or_default().push(RouteEntry {
            name: route_name.to_string(),
            handler,
        });
    }

    fn handles(&self, kind: &Kind) -> bool {
        self.handlers.lock().unwrap().get(kind).is_some_and(|h| !h.is_empty())
    }

    fn handler_kinds(&self) -> Vec<Kind> {
        self.handlers.lock().unwrap().keys().cloned().collect()
    }

    /// Starts watching every kind with registered handlers, then starts the
    /// backend's controllers.
    pub async fn start(self: &Arc<Self>, ct: &CancellationToken) -> Result<(), RuntimeError> {
        let _ = self.ct.set(ct.clone());
        for kind in self.handler_kinds() {
            self.watch_kind(&kind).await?;
        }
        self.backend.start(ct).await
    }

    /// Read-only standby: watch registrations plus informer sync, no workers.
    pub async fn preload(self: &Arc<Self>, ct: &CancellationToken) -> Result<(), RuntimeError> {
        let _ = self.ct.set(ct.clone());
        for kind in self.handler_kinds() {
            self.watch_kind(&kind).await?;
        }
        self.backend.preload(ct).await
    }

    /// Ensures this set receives the kind's events. Idempotent; also invoked
    /// mid-reconcile when a read subscribes to a new kind.
    pub(crate) async fn watch_kind(self: &Arc<Self>, kind: &Kind) -> Result<(), RuntimeError> {
        let mut watching = self.watching.lock().await;
        if watching.contains(kind) {
            return Ok(());
        }
        let ct = self.ct.get().cloned().ok_or(RuntimeError::Cancelled)?;
        let handler = Arc::new(SetChangeHandler { kind: kind.clone(), set: self.clone() });
        self.backend.watcher(&ct, kind, &self.name, handler).await?;
        watching.insert(kind.clone());
        Ok(())
    }

    /// The gate: false means this dispatch must abort; a deferred `_r `
    /// replay has been (or already was) scheduled.
    fn check_delay(self: &Arc<Self>, kind: &Kind, key: &str) -> bool {
        let lkey = LimiterKey { kind: kind.clone(), key: key.to_string() };
        let delay = {
            let mut state = self.limiters.lock().unwrap();
            if state.waiting.contains(&lkey) {
                return false;
            }
            let delay = state.limiters.entry(lkey.clone()).or_insert_with(TokenBucket::new).reserve();
            if delay.is_zero() {
                return true;
            }
            state.waiting.insert(lkey.clone());
            delay
        };

        counter!("rate_limit_deferred_total", 1u64);
        let limiters = self.limiters.clone();
        let backend = self.backend.clone();
        let kind = kind.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            debug!(kind = %kind, key = %key, delay_ms = delay.as_millis() as u64, "backing off");
            tokio::time::sleep(delay).await;
            limiters.lock().unwrap().waiting.remove(&lkey);
            let replay_key = format!("{REPLAY_PREFIX}{key}");
            if let Err(e) = backend.trigger(&kind, &replay_key, Duration::ZERO).await {
                debug!(kind = %kind, key = %key, error = %e, "replay dropped");
            }
        });
        false
    }

    fn forget_backoff(&self, kind: &Kind, key: &str) {
        let lkey = LimiterKey { kind: kind.clone(), key: key.to_string() };
        self.limiters.lock().unwrap().limiters.remove(&lkey);
    }

    fn handle_error(
        &self,
        req: &Request,
        resp: &Response,
        err: Option<anyhow::Error>,
    ) -> Option<anyhow::Error> {
        let cb = self.on_error.lock().unwrap().clone();
        match cb {
            Some(cb) => cb(req, resp, err),
            None => err,
        }
    }

    /// Single entry point from the controllers. Mirrors the event key
    /// conventions: plain keys pass the gate, `_t ` marks a dependency
    /// trigger, `_r ` marks a gate replay.
    pub(crate) async fn on_change(
        self: &Arc<Self>,
        ct: &CancellationToken,
        kind: &Kind,
        key: &str,
        informer_obj: Option<Obj>,
    ) -> anyhow::Result<Option<Obj>> {
        let mut key = key;
        let mut from_trigger = false;
        let mut from_replay = false;
        if let Some(rest) = key.strip_prefix(TRIGGER_PREFIX) {
            from_trigger = true;
            key = rest;
        }
        if let Some(rest) = key.strip_prefix(REPLAY_PREFIX) {
            from_trigger = false;
            from_replay = true;
            key = rest;
        }

        if !from_replay && !from_trigger && !self.check_delay(kind, key) {
            return Ok(informer_obj);
        }

        let (namespace, name) = key_parse(key);

        let lock_key = format!("{} {}", kind.kind, key);
        let _guard = self.locker.lock(&lock_key).await;

        let mut obj = informer_obj;
        match self.backend.client().get(kind, &namespace, &name).await {
            Ok(fresh) => obj = Some(fresh),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        if obj.is_none() {
            self.forget_backoff(kind, key);
        }

        self.handle(ct, kind, key, obj, from_trigger).await
    }

    async fn run_handlers(&self, kind: &Kind, req: &mut Request, resp: &mut Response) -> Option<anyhow::Error> {
        let entries: Vec<(String, Arc<dyn Handler>)> = {
            let handlers = self.handlers.lock().unwrap();
            handlers
                .get(kind)
                .map(|list| list.iter().map(|e| (e.name.clone(), e.handler.clone())).collect())
                .unwrap_or_default()
        };

        let mut errs = ErrorList::default();
        for (name, handler) in entries {
            if let Err(err) = handler.handle(req, resp).await {
                if !is_ignore(&err) {
                    errs.push(HandlerError { handler: name, source: err });
                }
            }
        }
        if errs.is_empty() {
            None
        } else {
            Some(errs.into())
        }
    }

    async fn handle(
        self: &Arc<Self>,
        ct: &CancellationToken,
        kind: &Kind,
        key: &str,
        unmodified: Option<Obj>,
        from_trigger: bool,
    ) -> anyhow::Result<Option<Obj>> {
        let (namespace, name) = key_parse(key);
        let registry = RequestTriggers::new(
            EnqueueTarget { kind: kind.clone(), key: key.to_string() },
            self.clone(),
        );
        let client = Client::new(self.backend.client(), registry.clone());
        let mut req = Request {
            ct: ct.clone(),
            kind: kind.clone(),
            namespace,
            name,
            key: key.to_string(),
            object: unmodified.clone(),
            from_trigger,
            client,
        };
        let mut resp = Response::new(registry);

        let handles = self.handles(kind);
        if handles {
            if from_trigger {
                debug!(kind = %kind, key = %key, "handling trigger");
            } else {
                debug!(kind = %kind, key = %key, "handling");
            }
            if let Some(err) = self.run_handlers(kind, &mut req, &mut resp).await {
                if let Some(err) = self.handle_error(&req, &resp, Some(err)) {
                    return Err(err);
                }
            }
        }

        if unmodified.is_none() {
            // deleted: drop this object's subscriptions, then notify watchers
            self.triggers
                .unregister_and_trigger(kind, key, &req.namespace, &req.name, req.object.as_ref())
                .await;
        } else if !req.from_trigger {
            // skipping fan-out for triggered dispatches avoids amplification
            self.triggers
                .trigger(kind, key, &req.namespace, &req.name, req.object.as_ref())
                .await;
        }

        if handles {
            match save::save(unmodified.as_ref(), &mut req).await {
                Ok(saved) => req.object = saved,
                Err(err) => {
                    if let Some(err) = self.handle_error(&req, &resp, Some(err)) {
                        return Err(err);
                    }
                }
            }

            let delay = resp.delay();
            if !delay.is_zero() {
                self.backend.trigger(kind, key, delay).await?;
            }
        }

        match self.handle_error(&req, &resp, None) {
            Some(err) => Err(err),
            None => Ok(req.object.take()),
        }
    }
}

/// Adapter: a controller's per-kind callback into this set.
struct SetChangeHandler {
    kind: Kind,
    set: Arc<HandlerSet>,
}

#[async_trait]
impl ChangeHandler for SetChangeHandler {
    async fn on_change(
        &self,
        ct: &CancellationToken,
        key: &str,
        obj: Option<Obj>,
    ) -> anyhow::Result<Option<Obj>> {
        self.set.on_change(ct, &self.kind, key, obj).await
    }
}
