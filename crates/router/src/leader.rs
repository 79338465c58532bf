//! Leader-election wiring.
//!
//! The election primitive itself is supplied by the caller behind
//! [`LeaderLock`]; the router only decides what to run on each side of it:
//! the leader starts handlers, everyone else preloads caches and stays a
//! warm read-only standby.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// External singleton-selection primitive.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Campaigns until this identity holds the lock or `ct` is cancelled.
    async fn acquire(&self, ct: &CancellationToken, id: &str) -> anyhow::Result<()>;

    /// The identity currently observed holding the lock, if any.
    async fn leader(&self) -> Option<String>;
}

/// Trivial lock for single-replica deployments and tests: always acquired.
pub struct AlwaysLeader;

#[async_trait]
impl LeaderLock for AlwaysLeader {
    async fn acquire(&self, _ct: &CancellationToken, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn leader(&self) -> Option<String> {
        None
    }
}

#[derive(Clone)]
pub struct ElectionConfig {
    pub lock: Arc<dyn LeaderLock>,
    /// Defaults to $HOSTNAME, falling back to a random identity.
    pub identity: Option<String>,
}

impl ElectionConfig {
    pub fn new(lock: Arc<dyn LeaderLock>) -> Self {
        Self { lock, identity: None }
    }

    pub fn identity(&self) -> String {
        self.identity.clone().unwrap_or_else(|| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string())
        })
    }
}
