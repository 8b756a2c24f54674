//! Scripted collaborators and instrumented stores for engine tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use stanza_rs::config::EngineConfig;
use stanza_rs::engine::{Backends, Collaborators, Engine};
use stanza_rs::error::Result;
use stanza_rs::llm::{
    Aligner, RecipeGenerator, RegenerateRequest, Translator, UpstreamError, UpstreamErrorKind,
};
use stanza_rs::lock::{LockService, MemoryLockService};
use stanza_rs::model::{
    AlignedWord, Job, JobId, Mode, NewJob, Recipe, RecipeBundle, TranslationContext, Variant,
};
use stanza_rs::recipe::{MemoryRecipeStore, RecipeStore};
use stanza_rs::store::{CasOutcome, MemoryStore, VersionedStore};

pub const NEAR_DUPLICATES: [&str; 3] = [
    "the moon rose over silent water and cold stone",
    "the moon rose over silent water and cold stone tonight",
    "the moon wept",
];

const SLOT_WORDS: [(&str, &str); 6] = [
    ("amber", "hush"),
    ("cobalt", "drift"),
    ("scarlet", "murmur"),
    ("ivory", "pulse"),
    ("umber", "flare"),
    ("violet", "gleam"),
];

/// A poem of `sizes.len()` stanzas whose lines read "line 1", "line 2", ...
pub fn poem(sizes: &[usize], mode: Mode) -> NewJob {
    let mut n = 0;
    let chunks = sizes
        .iter()
        .map(|size| {
            (0..*size)
                .map(|_| {
                    n += 1;
                    format!("line {n}")
                })
                .collect()
        })
        .collect();
    NewJob::new(TranslationContext::new("fr", "en", mode), chunks)
}

/// Engine defaults with fast recipe backoff.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.recipes.backoff_base_ms = 2;
    config.recipes.backoff_cap_ms = 10;
    config.recipes.max_lock_attempts = 4;
    config
}

// ---------------------------------------------------------------------------
// Translator
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedTranslator {
    latency: Duration,
    variants: usize,
    always_fail: Mutex<HashMap<String, UpstreamErrorKind>>,
    duplicates: Mutex<HashSet<String>>,
    candidates: Mutex<Vec<String>>,
    pub translate_calls: AtomicUsize,
    pub regenerate_calls: AtomicUsize,
    inflight: AtomicUsize,
    pub max_inflight: AtomicUsize,
}

impl ScriptedTranslator {
    pub fn new() -> Self {
        Self {
            variants: 3,
            candidates: Mutex::new(vec!["night swallows a pale lantern".to_string()]),
            ..Default::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every call for `source` fails with `kind`.
    pub fn fail_always(self, source: &str, kind: UpstreamErrorKind) -> Self {
        self.always_fail.lock().unwrap().insert(source.to_string(), kind);
        self
    }

    /// `source` comes back as [`NEAR_DUPLICATES`].
    pub fn duplicate(self, source: &str) -> Self {
        self.duplicates.lock().unwrap().insert(source.to_string());
        self
    }

    /// Texts returned by `regenerate_one`.
    pub fn candidates(self, texts: &[&str]) -> Self {
        *self.candidates.lock().unwrap() = texts.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn translate_calls(&self) -> usize {
        self.translate_calls.load(Ordering::SeqCst)
    }

    pub fn regenerate_calls(&self) -> usize {
        self.regenerate_calls.load(Ordering::SeqCst)
    }

    async fn simulate_call(&self) {
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Translator for ScriptedTranslator {
    async fn translate(
        &self,
        source: &str,
        _context: &TranslationContext,
        _recipes: Option<&RecipeBundle>,
    ) -> std::result::Result<Vec<Variant>, UpstreamError> {
        self.translate_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await;

        if let Some(kind) = self.always_fail.lock().unwrap().get(source).copied() {
            return Err(UpstreamError::new(kind, format!("scripted {kind} for {source}")));
        }
        let labels = ["A", "B", "C", "D", "E", "F"];
        if self.duplicates.lock().unwrap().contains(source) {
            return Ok(NEAR_DUPLICATES
                .iter()
                .zip(labels)
                .map(|(t, l)| Variant::new(l, *t))
                .collect());
        }
        Ok((0..self.variants)
            .map(|i| {
                let (a, b) = SLOT_WORDS[i % SLOT_WORDS.len()];
                Variant::new(labels[i % labels.len()], format!("{a} {b} {source}"))
            })
            .collect())
    }

    async fn regenerate_one(
        &self,
        request: &RegenerateRequest,
    ) -> std::result::Result<Vec<Variant>, UpstreamError> {
        self.regenerate_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await;
        Ok(self
            .candidates
            .lock()
            .unwrap()
            .iter()
            .take(request.samples.max(1))
            .map(|t| Variant::new("?", t.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Aligner
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedAligner {
    /// Batched calls return the wrong number of alignments.
    pub reject_batches: bool,
    pub calls: AtomicUsize,
}

impl ScriptedAligner {
    pub fn rejecting_batches() -> Self {
        Self {
            reject_batches: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Aligner for ScriptedAligner {
    async fn align(
        &self,
        source: &str,
        variants: &[String],
    ) -> std::result::Result<Vec<Vec<AlignedWord>>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_batches && variants.len() > 1 {
            return Ok(Vec::new());
        }
        let first = |s: &str| s.split_whitespace().next().unwrap_or_default().to_string();
        Ok(variants
            .iter()
            .map(|v| {
                vec![AlignedWord {
                    source: first(source),
                    target: first(v),
                }]
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Recipe generator
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedRecipes {
    pub delay: Duration,
    pub fail: Option<UpstreamErrorKind>,
    pub calls: AtomicUsize,
}

impl ScriptedRecipes {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn failing(kind: UpstreamErrorKind) -> Self {
        Self {
            fail: Some(kind),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecipeGenerator for ScriptedRecipes {
    async fn generate_recipes(
        &self,
        context: &TranslationContext,
        mode: Mode,
    ) -> std::result::Result<RecipeBundle, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(kind) = self.fail {
            return Err(UpstreamError::new(kind, format!("scripted {kind} for recipes")));
        }
        let recipes = ["literal", "sonic", "imagistic"]
            .iter()
            .zip(["A", "B", "C"])
            .map(|(lens, label)| Recipe {
                label: label.to_string(),
                lens: lens.to_string(),
                directive: format!("translate with a {lens} lens"),
            })
            .collect();
        Ok(RecipeBundle::new(mode, context.content_hash(), recipes))
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Memory store that records every landed write and can inject conflicts
/// or a regressed read-back.
#[derive(Default)]
pub struct TestStore {
    inner: MemoryStore,
    /// Every other CAS loses to a simulated concurrent writer.
    alternate_conflicts: AtomicBool,
    flip: AtomicBool,
    /// The next load after a landed write returns a document with lines dropped.
    regress_after_write: AtomicBool,
    regress_next_load: AtomicBool,
    history: Mutex<Vec<Job>>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alternating_conflicts() -> Self {
        let store = Self::default();
        store.alternate_conflicts.store(true, Ordering::SeqCst);
        store
    }

    pub fn regressing() -> Self {
        let store = Self::default();
        store.regress_after_write.store(true, Ordering::SeqCst);
        store
    }

    /// Documents as written, in order.
    pub fn history(&self) -> Vec<Job> {
        self.history.lock().unwrap().clone()
    }

    fn record(&self, job: &Job, version: u64) {
        let mut job = job.clone();
        job.version = version;
        self.history.lock().unwrap().push(job);
    }
}

#[async_trait]
impl VersionedStore for TestStore {
    async fn create(&self, job: &Job) -> Result<u64> {
        let version = self.inner.create(job).await?;
        self.record(job, version);
        Ok(version)
    }

    async fn load(&self, id: JobId) -> Result<Job> {
        let mut job = self.inner.load(id).await?;
        if self.regress_next_load.swap(false, Ordering::SeqCst) {
            for chunk in job.chunks.values_mut() {
                chunk.lines.clear();
                chunk.lines_processed = 0;
            }
        }
        Ok(job)
    }

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: u64,
        job: &Job,
    ) -> Result<CasOutcome> {
        if self.alternate_conflicts.load(Ordering::SeqCst) && !self.flip.fetch_xor(true, Ordering::SeqCst)
        {
            // Someone else rewrote the same document first.
            let current = self.inner.load(id).await?;
            if let CasOutcome::Applied { version } =
                self.inner.compare_and_swap(id, current.version, &current).await?
            {
                self.record(&current, version);
                return Ok(CasOutcome::Conflict { current: version });
            }
        }

        let outcome = self.inner.compare_and_swap(id, expected_version, job).await?;
        if let CasOutcome::Applied { version } = outcome {
            self.record(job, version);
            if self.regress_after_write.load(Ordering::SeqCst) {
                self.regress_next_load.store(true, Ordering::SeqCst);
            }
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<TestStore>,
    pub locks: Arc<MemoryLockService>,
    pub recipe_store: Arc<MemoryRecipeStore>,
    pub translator: Arc<ScriptedTranslator>,
    pub aligner: Arc<ScriptedAligner>,
    pub recipes: Arc<ScriptedRecipes>,
}

impl Harness {
    pub fn new(config: EngineConfig, translator: ScriptedTranslator) -> Self {
        Self::with_parts(
            config,
            Arc::new(TestStore::new()),
            translator,
            ScriptedAligner::default(),
        )
    }

    pub fn with_parts(
        config: EngineConfig,
        store: Arc<TestStore>,
        translator: ScriptedTranslator,
        aligner: ScriptedAligner,
    ) -> Self {
        Self::with_recipes(config, store, translator, aligner, ScriptedRecipes::default())
    }

    pub fn with_recipes(
        config: EngineConfig,
        store: Arc<TestStore>,
        translator: ScriptedTranslator,
        aligner: ScriptedAligner,
        recipes: ScriptedRecipes,
    ) -> Self {
        let locks = Arc::new(MemoryLockService::new());
        let recipe_store = Arc::new(MemoryRecipeStore::new());
        let translator = Arc::new(translator);
        let aligner = Arc::new(aligner);
        let recipes = Arc::new(recipes);
        let engine = build_engine(
            config,
            store.clone(),
            locks.clone(),
            recipe_store.clone(),
            translator.clone(),
            aligner.clone(),
            recipes.clone(),
        );
        Self {
            engine,
            store,
            locks,
            recipe_store,
            translator,
            aligner,
            recipes,
        }
    }

    /// Advance until the job has no work left, failing the test after `max_ticks`.
    pub async fn run_to_end(&self, id: JobId, max_ticks: usize) -> Job {
        for _ in 0..max_ticks {
            let tick = self.engine.advance(id).await.unwrap();
            if !tick.has_work_remaining {
                return self.engine.get_job(id).await.unwrap();
            }
        }
        panic!("job {id} still has work after {max_ticks} ticks");
    }
}

pub fn build_engine(
    config: EngineConfig,
    store: Arc<dyn VersionedStore>,
    locks: Arc<dyn LockService>,
    recipe_store: Arc<dyn RecipeStore>,
    translator: Arc<ScriptedTranslator>,
    aligner: Arc<ScriptedAligner>,
    recipes: Arc<ScriptedRecipes>,
) -> Engine {
    Engine::new(
        Backends {
            jobs: store,
            locks,
            recipes: recipe_store,
        },
        Collaborators {
            translator,
            aligner,
            recipe_generator: recipes,
        },
        config,
    )
    .expect("valid test config")
}
