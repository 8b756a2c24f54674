//! Translation job engine.
//!
//! [`Engine`] is the surface callers use: create a job, advance it one tick
//! at a time (or hand it to a [`Driver`]), and read snapshots for display.

pub mod chunk;
pub mod driver;
pub mod state;
pub mod tick;

pub use chunk::ChunkProcessor;
pub use driver::{DriveOutcome, Driver};
pub use state::{ChunkOutcome, ProcessingStatus, compute_processing_status};
pub use tick::{TickResult, TickScheduler, TickSkip};

use std::sync::Arc;

use tracing::info;

use crate::config::engine::EngineConfig;
use crate::error::Result;
use crate::llm::{Aligner, RecipeGenerator, Translator};
use crate::lock::LockService;
use crate::model::{Job, JobId, NewJob};
use crate::quality::{DiversityGate, Regenerator};
use crate::recipe::{RecipeCache, RecipeStore};
use crate::store::VersionedStore;

/// The external model roles the engine calls.
#[derive(Clone)]
pub struct Collaborators {
    pub translator: Arc<dyn Translator>,
    pub aligner: Arc<dyn Aligner>,
    pub recipe_generator: Arc<dyn RecipeGenerator>,
}

impl Collaborators {
    /// One value serving all three roles.
    pub fn shared<T>(collaborator: Arc<T>) -> Self
    where
        T: Translator + Aligner + RecipeGenerator + 'static,
    {
        Self {
            translator: collaborator.clone(),
            aligner: collaborator.clone(),
            recipe_generator: collaborator,
        }
    }
}

/// Storage backends the engine is wired to.
#[derive(Clone)]
pub struct Backends {
    pub jobs: Arc<dyn VersionedStore>,
    pub locks: Arc<dyn LockService>,
    pub recipes: Arc<dyn RecipeStore>,
}

pub struct Engine {
    store: Arc<dyn VersionedStore>,
    scheduler: Arc<TickScheduler>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(backends: Backends, collaborators: Collaborators, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let gate = DiversityGate::new(config.diversity.clone());
        let call_timeout = config.processing.call_timeout();
        let regenerator = Arc::new(Regenerator::new(
            Arc::clone(&collaborators.translator),
            gate.clone(),
            &config.regeneration,
            call_timeout,
        ));
        let processor = ChunkProcessor::new(
            collaborators.translator,
            collaborators.aligner,
            gate,
            regenerator,
            &config.processing,
        );
        let recipes = Arc::new(RecipeCache::new(
            backends.recipes,
            Arc::clone(&backends.locks),
            collaborators.recipe_generator,
            config.recipes.clone(),
            call_timeout,
        ));
        let scheduler = Arc::new(TickScheduler::new(
            Arc::clone(&backends.jobs),
            backends.locks,
            recipes,
            processor,
            config.scheduler.clone(),
        ));

        Ok(Self {
            store: backends.jobs,
            scheduler,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Persist a new job. The returned snapshot carries its first version.
    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        let mut job = state::build_job(new, &self.config)?;
        job.version = self.store.create(&job).await?;
        info!(
            job_id = %job.id,
            chunks = job.chunks.len(),
            lines = job.total_lines(),
            mode = %job.context.mode,
            "job created"
        );
        Ok(job)
    }

    pub async fn advance(&self, job_id: JobId) -> Result<TickResult> {
        self.scheduler.advance(job_id).await
    }

    /// Read-only snapshot.
    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.store.load(job_id).await
    }

    pub async fn processing_status(&self, job_id: JobId) -> Result<(Job, ProcessingStatus)> {
        let job = self.store.load(job_id).await?;
        let status = compute_processing_status(&job);
        Ok((job, status))
    }

    pub fn driver(&self) -> Driver {
        Driver::new(Arc::clone(&self.scheduler), self.config.scheduler.poll_interval())
    }

    pub fn scheduler(&self) -> Arc<TickScheduler> {
        Arc::clone(&self.scheduler)
    }
}
