//! In-process lock service.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{LockService, LockToken};
use crate::error::{Error, Result};

struct Held {
    token: LockToken,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryLockService {
    held: Mutex<HashMap<String, Held>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Held>>> {
        self.held
            .lock()
            .map_err(|e| Error::Other(format!("lock table mutex poisoned: {e}")))
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = Instant::now();
        let mut held = self.held()?;
        if held.get(key).is_some_and(|h| h.expires_at > now) {
            return Ok(None);
        }
        let token = LockToken::generate();
        held.insert(
            key.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn heartbeat(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut held = self.held()?;
        match held.get_mut(key) {
            Some(h) if &h.token == token && h.expires_at > now => {
                h.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut held = self.held()?;
        if held.get(key).is_some_and(|h| &h.token == token) {
            held.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
