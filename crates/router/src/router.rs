//! Top-level router: route registration, leader election, health flagging,
//! post-start hooks, graceful stop.

use std::panic::Location;
use std::sync::{Arc, Mutex};

use rudder_core::Kind;
use rudder_runtime::{CacheClient, RuntimeBackend};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::handler_set::HandlerSet;
use crate::health;
use crate::leader::ElectionConfig;
use crate::request::{ErrorCallback, Handler};
use crate::route::RouteBuilder;

pub type PostStartFn = Box<dyn FnOnce(CancellationToken, Arc<CacheClient>) + Send>;

/// One reconciliation domain: a handler set plus its lifecycle wiring.
pub struct Router {
    name: String,
    handler_set: Arc<HandlerSet>,
    election: Option<ElectionConfig>,
    on_error: Mutex<Option<ErrorCallback>>,
    post_starts: Mutex<Vec<PostStartFn>>,
    stopped: CancellationToken,
    start_lock: tokio::sync::Mutex<()>,
}

impl Router {
    /// A nil election config is valid and means no leader election. A zero
    /// healthz port leaves the health endpoint off; across routers the first
    /// positive port wins, and the endpoint starts with the first `start`.
    pub fn new(
        handler_set: Arc<HandlerSet>,
        election: Option<ElectionConfig>,
        healthz_port: u16,
    ) -> Arc<Self> {
        if healthz_port > 0 {
            health::set_port(healthz_port);
        }
        Arc::new(Self {
            name: handler_set.name().to_string(),
            handler_set,
            election,
            on_error: Mutex::new(None),
            post_starts: Mutex::new(Vec::new()),
            stopped: CancellationToken::new(),
            start_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn backend(&self) -> Arc<RuntimeBackend> {
        self.handler_set.backend()
    }

    pub fn client(&self) -> Arc<CacheClient> {
        self.backend().client()
    }

    pub fn dump_triggers(&self, indent: bool) -> String {
        self.handler_set.dump_triggers(indent)
    }

    /// Replaces the router-level error callback. Takes effect at `start`.
    pub fn on_error(&self, cb: ErrorCallback) {
        *self.on_error.lock().unwrap() = Some(cb);
    }

    /// Runs after handlers start (on the leader, when elections are on).
    pub fn post_start(&self, f: PostStartFn) {
        self.post_starts.lock().unwrap().push(f);
    }

    /// Cancelled once handlers have shut down and workers have drained.
    pub fn stopped(&self) -> CancellationToken {
        self.stopped.clone()
    }

    pub fn route(self: &Arc<Self>) -> RouteBuilder {
        RouteBuilder::new(self.handler_set.clone())
    }

    #[track_caller]
    pub fn handle(self: &Arc<Self>, kind: Kind, handler: Arc<dyn Handler>) {
        let route_name = crate::route::caller_name(Location::caller());
        self.route().kind(kind).route_name(route_name).handler(handler);
    }

    pub async fn start(self: &Arc<Self>, ct: &CancellationToken) -> anyhow::Result<()> {
        health::start_healthz(ct);
        self.handler_set.set_error_callback(self.on_error.lock().unwrap().clone());

        match self.election.clone() {
            None => {
                self.start_handlers(ct).await?;
                self.arm_stop_signal(ct);
            }
            Some(cfg) => {
                let this = self.clone();
                let ct = ct.clone();
                tokio::spawn(async move { this.run_election(cfg, ct).await });
            }
        }
        Ok(())
    }

    async fn run_election(self: Arc<Self>, cfg: ElectionConfig, ct: CancellationToken) {
        let id = cfg.identity();

        if let Some(leader) = cfg.lock.leader().await {
            if leader != id {
                info!(router = %self.name, leader = %leader, "not the leader; preloading caches");
                health::set_healthy(&self.name, false);
                match self.handler_set.preload(&ct).await {
                    Ok(()) => health::set_healthy(&self.name, true),
                    Err(e) => {
                        error!(router = %self.name, error = %e, "standby preload failed");
                        return;
                    }
                }
            }
        }

        tokio::select! {
            _ = ct.cancelled() => {
                self.stopped.cancel();
            }
            res = cfg.lock.acquire(&ct, &id) => match res {
                Ok(()) => {
                    info!(router = %self.name, id = %id, "became leader");
                    if let Err(e) = self.start_handlers(&ct).await {
                        let chain = format!("{e:#}");
                        error!(router = %self.name, error = %chain, "failed to start handlers");
                    }
                    self.arm_stop_signal(&ct);
                }
                Err(e) => {
                    let chain = format!("{e:#}");
                    error!(router = %self.name, error = %chain, "leader election failed");
                }
            }
        }
    }

    async fn start_handlers(self: &Arc<Self>, ct: &CancellationToken) -> anyhow::Result<()> {
        let _guard = self.start_lock.lock().await;

        health::set_healthy(&self.name, false);
        let result = self.handler_set.start(ct).await;
        health::set_healthy(&self.name, result.is_ok());
        result?;

        let hooks: Vec<PostStartFn> = std::mem::take(&mut *self.post_starts.lock().unwrap());
        for hook in hooks {
            hook(ct.clone(), self.client());
        }
        Ok(())
    }

    fn arm_stop_signal(self: &Arc<Self>, ct: &CancellationToken) {
        let this = self.clone();
        let ct = ct.clone();
        tokio::spawn(async move {
            ct.cancelled().await;
            this.backend().stopped().await;
            info!(router = %this.name, "stopped");
            this.stopped.cancel();
        });
    }
}
