//! Polling loop that drives one job to a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use super::tick::{TickResult, TickScheduler};
use crate::error::Result;
use crate::model::JobId;

/// How a driver run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DriveOutcome {
    /// The last tick reported no remaining work.
    Finished(TickResult),
    /// `shutdown` was called first.
    Stopped,
}

/// Calls `advance` until the job has no work left. Skipped ticks and
/// retryable errors back off for `poll_interval`; anything else stops the loop.
pub struct Driver {
    scheduler: Arc<TickScheduler>,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl Clone for Driver {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
            poll_interval: self.poll_interval,
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl Driver {
    pub fn new(scheduler: Arc<TickScheduler>, poll_interval: Duration) -> Self {
        Self {
            scheduler,
            poll_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the driver to stop after the current tick.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub async fn run_until_complete(&self, job_id: JobId) -> Result<DriveOutcome> {
        info!(job_id = %job_id, "driver started");
        let mut ticks = 0u64;

        loop {
            let wait = match self.scheduler.advance(job_id).await {
                Ok(tick) if !tick.has_work_remaining => {
                    info!(job_id = %job_id, ticks, status = %tick.status, "driver finished");
                    return Ok(DriveOutcome::Finished(tick));
                }
                Ok(tick) if tick.skipped.is_some() => self.poll_interval,
                Ok(tick) => {
                    ticks += 1;
                    info!(
                        job_id = %job_id,
                        tick = ticks,
                        chunks = tick.chunks_processed,
                        lines = tick.lines_translated,
                        "tick advanced"
                    );
                    Duration::ZERO
                }
                Err(e) if e.is_retryable() => {
                    warn!(job_id = %job_id, code = e.code(), error = %e, "tick failed, backing off");
                    self.poll_interval
                }
                Err(e) => return Err(e),
            };

            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!(job_id = %job_id, "driver shutting down");
                    return Ok(DriveOutcome::Stopped);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
