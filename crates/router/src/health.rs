//! Process-wide health endpoint.
//!
//! Routers flag themselves healthy or not; `GET /healthz` answers "ok" only
//! when every registered router is healthy. The server starts once, with the
//! first router, on the first positive port any router was built with.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use axum::http::StatusCode;
use axum::routing::get;
use once_cell::sync::{Lazy, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

static HEALTH: Lazy<Mutex<BTreeMap<String, bool>>> = Lazy::new(|| Mutex::new(BTreeMap::new()));
static PORT: OnceCell<u16> = OnceCell::new();
static STARTED: AtomicBool = AtomicBool::new(false);

/// First positive port wins across routers.
pub(crate) fn set_port(port: u16) {
    let _ = PORT.set(port);
}

pub(crate) fn set_healthy(name: &str, healthy: bool) {
    HEALTH.lock().unwrap().insert(name.to_string(), healthy);
}

fn healthy() -> bool {
    HEALTH.lock().unwrap().values().all(|ok| *ok)
}

async fn healthz_handler() -> (StatusCode, &'static str) {
    if healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}

/// No-op unless a port was configured; serves until `ct` is cancelled.
pub(crate) fn start_healthz(ct: &CancellationToken) {
    let Some(port) = PORT.get().copied() else {
        return;
    };
    if STARTED.swap(true, Ordering::SeqCst) {
        return;
    }
    let ct = ct.clone();
    tokio::spawn(async move {
        let addr = std::env::var("RUDDER_HEALTHZ_ADDR").unwrap_or_else(|_| "0.0.0.0".into());
        let app = axum::Router::new().route("/healthz", get(healthz_handler));
        let listener = match tokio::net::TcpListener::bind((addr.as_str(), port)).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %addr, port, error = %e, "healthz bind failed");
                return;
            }
        };
        info!(addr = %addr, port, "healthz serving");
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(ct.cancelled_owned())
            .await
        {
            error!(error = %e, "healthz server failed");
        }
    });
}
