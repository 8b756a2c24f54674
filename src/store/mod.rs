//! Versioned job document store.
//!
//! The whole document is read, mutated in memory and swapped back. A swap is
//! accepted only if the caller's observed version is still current, so the
//! mutate step must be pure: a losing writer reloads and re-applies.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Job, JobId};

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed; the document now carries `version`.
    Applied { version: u64 },
    /// Another writer got there first; `current` is the stored version.
    Conflict { current: u64 },
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied { .. })
    }
}

#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Insert a brand-new job. Its stored version becomes 1.
    async fn create(&self, job: &Job) -> Result<u64>;

    /// Load the current document. `job.version` is authoritative.
    async fn load(&self, id: JobId) -> Result<Job>;

    /// Replace the document if the stored version equals `expected_version`.
    /// On success the stored version is `expected_version + 1`.
    async fn compare_and_swap(&self, id: JobId, expected_version: u64, job: &Job)
    -> Result<CasOutcome>;
}
