//! In-process store used by tests and single-process runs.
//!
//! Documents are kept serialized so every load hands back an independent
//! copy, the same as a real document store would.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CasOutcome, VersionedStore};
use crate::error::{Error, Result};
use crate::model::{Job, JobId};

#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<JobId, (u64, serde_json::Value)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn docs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<JobId, (u64, serde_json::Value)>>> {
        self.docs
            .lock()
            .map_err(|e| Error::Other(format!("memory store mutex poisoned: {e}")))
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn create(&self, job: &Job) -> Result<u64> {
        let mut doc = job.clone();
        doc.version = 1;
        let value = serde_json::to_value(&doc)?;

        let mut docs = self.docs()?;
        if docs.contains_key(&job.id) {
            return Err(Error::InvalidInput(format!("job {} already exists", job.id)));
        }
        docs.insert(job.id, (1, value));
        Ok(1)
    }

    async fn load(&self, id: JobId) -> Result<Job> {
        let (version, value) = self
            .docs()?
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        let mut job: Job = serde_json::from_value(value)?;
        job.version = version;
        Ok(job)
    }

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: u64,
        job: &Job,
    ) -> Result<CasOutcome> {
        let mut doc = job.clone();
        doc.version = expected_version + 1;
        let value = serde_json::to_value(&doc)?;

        let mut docs = self.docs()?;
        let entry = docs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        if entry.0 != expected_version {
            return Ok(CasOutcome::Conflict { current: entry.0 });
        }
        *entry = (doc.version, value);
        Ok(CasOutcome::Applied {
            version: doc.version,
        })
    }
}
