//! Rudder router: the dispatch engine, trigger subscriptions, route
//! building, save-on-change, leader election wiring, and health.

#![forbid(unsafe_code)]

pub mod client;
pub mod handler_set;
mod health;
pub mod leader;
pub mod locker;
pub mod request;
pub mod route;
pub mod router;
mod save;
pub mod triggers;

pub use client::Client;
pub use handler_set::{HandlerSet, REPLAY_PREFIX, TRIGGER_PREFIX};
pub use leader::{AlwaysLeader, ElectionConfig, LeaderLock};
pub use locker::KeyLocker;
pub use request::{handler_fn, ErrorCallback, Handler, Request, Response};
pub use route::{Middleware, RouteBuilder};
pub use router::{PostStartFn, Router};
pub use triggers::{EnqueueTarget, ObjectMatcher, Triggers};

pub use rudder_runtime::{Ignore, RuntimeError};
