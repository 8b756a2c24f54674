//! Per-job, per-mode recipe cache.
//!
//! Lookup order: in-process map, then the persisted store (validated against
//! the context hash and schema version), then generation under a named lock
//! so concurrent ticks never generate the same bundle twice.

pub mod memory;

pub use memory::MemoryRecipeStore;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{Instrument, debug, info, warn};

use crate::config::engine::RecipeConfig;
use crate::error::{Error, Result};
use crate::llm::{RecipeGenerator, with_timeout};
use crate::lock::{LockLease, LockService, recipe_lock_key};
use crate::model::{JobId, Mode, RECIPE_SCHEMA_VERSION, RecipeBundle, TranslationContext};
use crate::telemetry::{job::start_recipe_span, metrics};

/// Persisted recipe bundles, one per (job, mode).
#[async_trait]
pub trait RecipeStore: Send + Sync {
    async fn get(&self, job_id: JobId, mode: Mode) -> Result<Option<RecipeBundle>>;
    async fn put(&self, job_id: JobId, bundle: &RecipeBundle) -> Result<()>;
}

pub struct RecipeCache {
    store: Arc<dyn RecipeStore>,
    locks: Arc<dyn LockService>,
    generator: Arc<dyn RecipeGenerator>,
    config: RecipeConfig,
    call_timeout: Duration,
    memory: Mutex<HashMap<(JobId, Mode), Arc<RecipeBundle>>>,
}

impl RecipeCache {
    pub fn new(
        store: Arc<dyn RecipeStore>,
        locks: Arc<dyn LockService>,
        generator: Arc<dyn RecipeGenerator>,
        config: RecipeConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            generator,
            config,
            call_timeout,
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Return a valid bundle for this job's context, generating it if needed.
    ///
    /// Fails with [`Error::RecipeGenerationContention`] when the generation
    /// lock stays held by someone else for every attempt.
    pub async fn get_or_create(
        &self,
        job_id: JobId,
        context: &TranslationContext,
    ) -> Result<Arc<RecipeBundle>> {
        let mode = context.mode;
        let hash = context.content_hash();

        if let Some(bundle) = self.cached(job_id, mode, &hash)? {
            return Ok(bundle);
        }
        if let Some(bundle) = self.persisted(job_id, mode, &hash).await? {
            return Ok(bundle);
        }

        let key = recipe_lock_key(job_id, mode, &hash);
        let attempts = self.config.max_lock_attempts;
        for attempt in 0..attempts {
            let lease =
                LockLease::try_acquire(Arc::clone(&self.locks), key.clone(), self.config.lock_ttl())
                    .await?;
            if let Some(lease) = lease {
                let result = self
                    .generate_locked(job_id, context, &hash)
                    .instrument(start_recipe_span(&job_id, mode))
                    .await;
                if let Err(e) = lease.release().await {
                    warn!(key = %key, error = %e, "failed to release recipe lock");
                }
                return result;
            }

            metrics::lock_contention().add(1, &[opentelemetry::KeyValue::new("lock", "recipe")]);
            if attempt + 1 == attempts {
                break;
            }
            let delay = backoff_delay(attempt, self.config.backoff_base_ms, self.config.backoff_cap_ms);
            debug!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "recipe lock busy, backing off");
            tokio::time::sleep(delay).await;

            // The holder may have finished while we slept.
            if let Some(bundle) = self.persisted(job_id, mode, &hash).await? {
                return Ok(bundle);
            }
        }

        warn!(key = %key, attempts, "gave up waiting for recipe lock");
        Err(Error::RecipeGenerationContention { key, attempts })
    }

    async fn generate_locked(
        &self,
        job_id: JobId,
        context: &TranslationContext,
        hash: &str,
    ) -> Result<Arc<RecipeBundle>> {
        // Another holder may have finished just before we got the lock.
        if let Some(bundle) = self.persisted(job_id, context.mode, hash).await? {
            return Ok(bundle);
        }

        let mut bundle = with_timeout(
            self.call_timeout,
            self.generator.generate_recipes(context, context.mode),
        )
        .await?;
        bundle.mode = context.mode;
        bundle.context_hash = hash.to_string();
        bundle.schema_version = RECIPE_SCHEMA_VERSION;

        self.store.put(job_id, &bundle).await?;
        info!(job_id = %job_id, mode = %context.mode, recipes = bundle.recipes.len(), "recipes generated");
        self.remember(job_id, bundle)
    }

    fn cached(&self, job_id: JobId, mode: Mode, hash: &str) -> Result<Option<Arc<RecipeBundle>>> {
        let memory = self.memory()?;
        Ok(memory
            .get(&(job_id, mode))
            .filter(|b| b.is_valid_for(hash))
            .cloned())
    }

    async fn persisted(
        &self,
        job_id: JobId,
        mode: Mode,
        hash: &str,
    ) -> Result<Option<Arc<RecipeBundle>>> {
        match self.store.get(job_id, mode).await? {
            Some(bundle) if bundle.is_valid_for(hash) => self.remember(job_id, bundle).map(Some),
            Some(_) => {
                debug!(job_id = %job_id, mode = %mode, "persisted recipes are stale");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn remember(&self, job_id: JobId, bundle: RecipeBundle) -> Result<Arc<RecipeBundle>> {
        let bundle = Arc::new(bundle);
        self.memory()?
            .insert((job_id, bundle.mode), Arc::clone(&bundle));
        Ok(bundle)
    }

    fn memory(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(JobId, Mode), Arc<RecipeBundle>>>> {
        self.memory
            .lock()
            .map_err(|e| Error::Other(format!("recipe cache mutex poisoned: {e}")))
    }
}

/// Exponential backoff with equal jitter: a random delay in `[d/2, d]`
/// where `d = min(cap, base * 2^attempt)`.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20)).min(cap_ms);
    let low = exp / 2;
    let ms = if exp > low {
        rand::rng().random_range(low..=exp)
    } else {
        exp
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_respects_cap() {
        for attempt in 0..12 {
            let d = backoff_delay(attempt, 200, 3_000).as_millis() as u64;
            let ceiling = (200u64 << attempt).min(3_000);
            assert!(d <= ceiling, "attempt {attempt}: {d} > {ceiling}");
            assert!(d >= ceiling / 2, "attempt {attempt}: {d} < {}", ceiling / 2);
        }
    }
}
