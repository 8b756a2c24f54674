//! One bounded advance of a job.
//!
//! A tick takes the per-job lock, plans on the loaded document, runs the
//! selected chunks in parallel under the time budget and swaps the result
//! back with a version check. On conflict the already computed outcomes are
//! applied to the reloaded document; no chunk is processed twice by one tick.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::chunk::ChunkProcessor;
use super::state::{
    ApplySummary, ChunkOutcome, apply_outcomes, check_monotonicity, ensure_queued_capacity,
    has_work_remaining, reconcile, select_chunks,
};
use crate::config::engine::SchedulerConfig;
use crate::error::{Error, Result};
use crate::lock::{LockLease, LockService, tick_lock_key};
use crate::model::{ChunkIndex, Job, JobId, JobStatus};
use crate::recipe::RecipeCache;
use crate::store::{CasOutcome, VersionedStore};
use crate::telemetry::job::{record_chunk_transition, start_tick_span};
use crate::telemetry::metrics;

/// Why a tick did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickSkip {
    /// Another poller holds the tick lock for this job.
    LockBusy,
    /// The job was already completed or failed.
    AlreadyComplete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickResult {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Stored version after this tick.
    pub version: u64,
    pub chunks_processed: usize,
    pub chunks_completed: usize,
    pub chunks_failed: usize,
    pub lines_translated: usize,
    pub lines_failed: usize,
    pub has_work_remaining: bool,
    /// Compare-and-swap attempts made; 0 when nothing was written.
    pub cas_attempts: u32,
    pub skipped: Option<TickSkip>,
}

impl TickResult {
    fn from_job(job: &Job, summary: &ApplySummary, cas_attempts: u32) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            version: job.version,
            chunks_processed: summary.chunks_processed,
            chunks_completed: summary.chunks_completed,
            chunks_failed: summary.chunks_failed,
            lines_translated: summary.lines_translated,
            lines_failed: summary.lines_failed,
            has_work_remaining: has_work_remaining(job),
            cas_attempts,
            skipped: None,
        }
    }

    fn skipped(job: &Job, reason: TickSkip) -> Self {
        let mut result = Self::from_job(job, &ApplySummary::default(), 0);
        result.skipped = Some(reason);
        if reason == TickSkip::LockBusy && !job.status.is_terminal() {
            result.has_work_remaining = true;
        }
        result
    }
}

pub struct TickScheduler {
    store: Arc<dyn VersionedStore>,
    locks: Arc<dyn LockService>,
    recipes: Arc<RecipeCache>,
    processor: ChunkProcessor,
    config: SchedulerConfig,
}

impl TickScheduler {
    pub fn new(
        store: Arc<dyn VersionedStore>,
        locks: Arc<dyn LockService>,
        recipes: Arc<RecipeCache>,
        processor: ChunkProcessor,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            locks,
            recipes,
            processor,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Advance `job_id` by one processing pass.
    pub async fn advance(&self, job_id: JobId) -> Result<TickResult> {
        let started = std::time::Instant::now();
        let result = self
            .advance_locked(job_id)
            .instrument(start_tick_span(&job_id))
            .await;

        metrics::tick_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        let label = match &result {
            Ok(r) => match r.skipped {
                Some(TickSkip::LockBusy) => "lock_busy",
                Some(TickSkip::AlreadyComplete) => "already_complete",
                None => "advanced",
            },
            Err(_) => "error",
        };
        metrics::tick_count().add(1, &[KeyValue::new("result", label)]);
        result
    }

    async fn advance_locked(&self, job_id: JobId) -> Result<TickResult> {
        let lease = LockLease::try_acquire(
            Arc::clone(&self.locks),
            tick_lock_key(job_id),
            self.config.tick_lock_ttl(),
        )
        .await?;
        let Some(lease) = lease else {
            info!(job_id = %job_id, "tick lock held elsewhere, skipping");
            metrics::lock_contention().add(1, &[KeyValue::new("lock", "tick")]);
            let job = self.store.load(job_id).await?;
            return Ok(TickResult::skipped(&job, TickSkip::LockBusy));
        };

        let result = self.run(job_id).await;
        if let Err(e) = lease.release().await {
            warn!(job_id = %job_id, error = %e, "failed to release tick lock");
        }
        result
    }

    async fn run(&self, job_id: JobId) -> Result<TickResult> {
        let deadline = Instant::now() + self.config.time_budget();
        let mut job = self.store.load(job_id).await?;
        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "job already finished");
            return Ok(TickResult::skipped(&job, TickSkip::AlreadyComplete));
        }

        let mut plan = job.clone();
        reconcile(&mut plan);
        ensure_queued_capacity(&mut plan);
        let selected = select_chunks(&plan);
        info!(
            job_id = %job_id,
            version = job.version,
            selected = ?selected,
            active = ?plan.active,
            queue = ?plan.queue,
            "chunks selected"
        );

        let outcomes = if selected.is_empty() {
            Vec::new()
        } else {
            self.process_chunks(&plan, &selected, deadline).await?
        };

        let mut attempt = 1u32;
        loop {
            let mut next = job.clone();
            let summary = apply_outcomes(&mut next, &outcomes)?;
            if next == job {
                debug!(job_id = %job_id, "nothing to persist");
                return Ok(TickResult::from_job(&job, &summary, 0));
            }
            next.updated_at = Utc::now();

            let cas_started = Instant::now();
            match self.store.compare_and_swap(job_id, job.version, &next).await? {
                CasOutcome::Applied { version } => {
                    next.version = version;
                    self.after_write(&next, &summary, attempt).await?;
                    return Ok(TickResult::from_job(&next, &summary, attempt));
                }
                CasOutcome::Conflict { current } => {
                    metrics::cas_conflicts().add(1, &[]);
                    warn!(
                        job_id = %job_id,
                        attempt,
                        expected = job.version,
                        current,
                        latency_ms = cas_started.elapsed().as_millis() as u64,
                        "version conflict, reapplying outcomes"
                    );
                    if attempt >= self.config.cas_max_attempts {
                        return Err(Error::VersionConflict {
                            id: job_id,
                            attempts: attempt,
                        });
                    }
                    attempt += 1;
                    job = self.store.load(job_id).await?;
                }
            }
        }
    }

    /// Run every selected chunk in parallel and collect outcomes in
    /// selection order.
    async fn process_chunks(
        &self,
        plan: &Job,
        selected: &[ChunkIndex],
        deadline: Instant,
    ) -> Result<Vec<ChunkOutcome>> {
        let recipes = match self.recipes.get_or_create(plan.id, &plan.context).await {
            Ok(bundle) => Some(bundle),
            Err(Error::Upstream(e)) => {
                warn!(
                    job_id = %plan.id,
                    kind = %e.kind,
                    error = %e,
                    "recipe generation failed, translating without recipes"
                );
                metrics::recipe_fallbacks().add(1, &[KeyValue::new("kind", e.kind.to_string())]);
                None
            }
            Err(e) => return Err(e),
        };

        let mut tasks = JoinSet::new();
        for index in selected {
            let Some(chunk) = plan.chunks.get(index).cloned() else {
                continue;
            };
            let processor = self.processor.clone();
            let context = plan.context.clone();
            let recipes = recipes.clone();
            let job_id = plan.id;
            tasks.spawn(
                async move {
                    processor
                        .process(job_id, &chunk, &context, recipes, deadline)
                        .await
                }
                .in_current_span(),
            );
        }

        let mut by_index = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    by_index.insert(outcome.index, outcome);
                }
                Err(e) => error!(error = %e, "chunk task panicked"),
            }
        }
        Ok(selected
            .iter()
            .filter_map(|i| by_index.remove(i))
            .collect())
    }

    /// Record what landed and verify the stored document did not regress.
    async fn after_write(&self, written: &Job, summary: &ApplySummary, attempts: u32) -> Result<()> {
        let span = Span::current();
        for (index, from, to) in &summary.transitions {
            record_chunk_transition(&span, *index, *from, *to);
        }
        span.record("tick.chunks_processed", summary.chunks_processed);
        span.record("tick.lines_translated", summary.lines_translated);
        span.record("tick.version", written.version);
        span.record("tick.cas_attempts", attempts);

        if written.status.is_terminal() {
            info!(
                job_id = %written.id,
                status = %written.status,
                lines = written.total_lines(),
                "job finished"
            );
        }

        let verified = self.store.load(written.id).await?;
        let violations = check_monotonicity(written, &verified);
        if violations.is_empty() {
            return Ok(());
        }
        metrics::monotonicity_violations().add(violations.len() as u64, &[]);
        let message = violations.join("; ");
        error!(job_id = %written.id, violations = %message, "monotonicity violation after write");
        if self.config.strict_monotonicity {
            return Err(Error::Monotonicity(message));
        }
        Ok(())
    }
}
