//! In-process recipe store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::RecipeStore;
use crate::error::{Error, Result};
use crate::model::{JobId, Mode, RecipeBundle};

#[derive(Default)]
pub struct MemoryRecipeStore {
    bundles: Mutex<HashMap<(JobId, Mode), RecipeBundle>>,
}

impl MemoryRecipeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bundles(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(JobId, Mode), RecipeBundle>>> {
        self.bundles
            .lock()
            .map_err(|e| Error::Other(format!("recipe store mutex poisoned: {e}")))
    }
}

#[async_trait]
impl RecipeStore for MemoryRecipeStore {
    async fn get(&self, job_id: JobId, mode: Mode) -> Result<Option<RecipeBundle>> {
        Ok(self.bundles()?.get(&(job_id, mode)).cloned())
    }

    async fn put(&self, job_id: JobId, bundle: &RecipeBundle) -> Result<()> {
        self.bundles()?.insert((job_id, bundle.mode), bundle.clone());
        Ok(())
    }
}
