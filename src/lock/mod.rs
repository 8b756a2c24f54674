//! Named TTL locks.
//!
//! Used to serialize ticks for one job and recipe generation for one
//! (job, mode, context) triple. A lock that is never released expires on its
//! own; holders keep it alive with heartbeats.

pub mod memory;

pub use memory::MemoryLockService;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{JobId, Mode};

/// Owner token. Random per acquisition, never reused across holders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub String);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Take the lock if it is free or expired. `None` means someone else holds it.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Extend the expiry. `false` if the token no longer owns the lock.
    async fn heartbeat(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool>;

    /// Drop the lock. `false` if the token no longer owns it.
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool>;
}

pub fn tick_lock_key(job_id: JobId) -> String {
    format!("tick:{job_id}")
}

pub fn recipe_lock_key(job_id: JobId, mode: Mode, context_hash: &str) -> String {
    format!("recipe-gen:{job_id}:{mode}:{context_hash}")
}

/// A held lock. A background task heartbeats every TTL/3 until the lease is
/// released or dropped; dropping without `release` leaves the lock to expire.
pub struct LockLease {
    service: Arc<dyn LockService>,
    key: String,
    token: LockToken,
    heartbeat: JoinHandle<()>,
}

impl LockLease {
    /// Try once to take `key`. `Ok(None)` when it is held by someone else.
    pub async fn try_acquire(
        service: Arc<dyn LockService>,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Result<Option<Self>> {
        let key = key.into();
        let Some(token) = service.acquire(&key, ttl).await? else {
            return Ok(None);
        };
        debug!(key = %key, "lock acquired");
        let heartbeat = spawn_heartbeat(Arc::clone(&service), key.clone(), token.clone(), ttl);
        Ok(Some(Self {
            service,
            key,
            token,
            heartbeat,
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Stop heartbeating and release the lock.
    pub async fn release(self) -> Result<bool> {
        self.heartbeat.abort();
        let released = self.service.release(&self.key, &self.token).await?;
        if !released {
            warn!(key = %self.key, "lock was lost before release");
        }
        Ok(released)
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

fn spawn_heartbeat(
    service: Arc<dyn LockService>,
    key: String,
    token: LockToken,
    ttl: Duration,
) -> JoinHandle<()> {
    let every = (ttl / 3).max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match service.heartbeat(&key, &token, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(key = %key, "heartbeat rejected, lock no longer owned");
                    return;
                }
                Err(e) => warn!(key = %key, error = %e, "heartbeat failed"),
            }
        }
    })
}
