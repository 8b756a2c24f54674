//! Engine tuning loaded from TOML. Every field has a default, so an empty
//! file (or no file) yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::Mode;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub processing: ProcessingConfig,
    pub diversity: DiversityConfig,
    pub regeneration: RegenerationConfig,
    pub recipes: RecipeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_chunks: usize,
    pub max_chunks_per_tick: usize,
    /// Wall-clock budget for one tick.
    pub time_budget_ms: u64,
    pub cas_max_attempts: u32,
    pub tick_lock_ttl_ms: u64,
    /// Treat a monotonicity violation as fatal instead of logging it.
    pub strict_monotonicity: bool,
    /// Driver back-off after a skipped tick or retryable error.
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 3,
            max_chunks_per_tick: 3,
            time_budget_ms: 45_000,
            cas_max_attempts: 3,
            tick_lock_ttl_ms: 120_000,
            strict_monotonicity: false,
            poll_interval_ms: 1_500,
        }
    }
}

impl SchedulerConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }

    pub fn tick_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.tick_lock_ttl_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Lines translated at once within a single chunk.
    pub line_concurrency: usize,
    pub variants_per_line: usize,
    pub max_retries: u32,
    /// Upper bound on any single translator/aligner call.
    pub call_timeout_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            line_concurrency: 6,
            variants_per_line: 3,
            max_retries: 3,
            call_timeout_ms: 60_000,
        }
    }
}

impl ProcessingConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// A value per generation mode.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PerMode<T> {
    pub conservative: T,
    pub balanced: T,
    pub adventurous: T,
}

impl<T: Copy> PerMode<T> {
    pub fn get(&self, mode: Mode) -> T {
        match mode {
            Mode::Conservative => self.conservative,
            Mode::Balanced => self.balanced,
            Mode::Adventurous => self.adventurous,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiversityConfig {
    /// Maximum allowed pairwise similarity per mode.
    pub thresholds: PerMode<f64>,
    /// Lines with fewer source tokens than this get `short_line_leniency`.
    pub short_line_tokens: usize,
    pub short_line_leniency: f64,
    /// Also compare token bigram sets and take the larger similarity.
    pub bigram_check: bool,
    /// Added to a pair's similarity when both report the same approach.
    pub approach_collision_penalty: f64,
}

impl Default for DiversityConfig {
    fn default() -> Self {
        Self {
            thresholds: PerMode {
                conservative: 0.80,
                balanced: 0.70,
                adventurous: 0.60,
            },
            short_line_tokens: 5,
            short_line_leniency: 0.10,
            bigram_check: false,
            approach_collision_penalty: 0.10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegenerationConfig {
    /// Candidates requested when salvaging the worst variant.
    pub samples: PerMode<usize>,
}

impl Default for RegenerationConfig {
    fn default() -> Self {
        Self {
            samples: PerMode {
                conservative: 1,
                balanced: 3,
                adventurous: 6,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecipeConfig {
    pub lock_ttl_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_lock_attempts: u32,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 90_000,
            backoff_base_ms: 200,
            backoff_cap_ms: 3_000,
            max_lock_attempts: 8,
        }
    }
}

impl RecipeConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read engine config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.max_concurrent_chunks == 0 || s.max_chunks_per_tick == 0 {
            return Err(Error::Config(
                "scheduler chunk limits must be at least 1".to_string(),
            ));
        }
        if s.cas_max_attempts == 0 {
            return Err(Error::Config("cas_max_attempts must be at least 1".to_string()));
        }
        if self.processing.line_concurrency == 0 || self.processing.variants_per_line == 0 {
            return Err(Error::Config(
                "line_concurrency and variants_per_line must be at least 1".to_string(),
            ));
        }
        let t = &self.diversity.thresholds;
        for (mode, value) in [
            ("conservative", t.conservative),
            ("balanced", t.balanced),
            ("adventurous", t.adventurous),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "diversity threshold for {mode} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.recipes.max_lock_attempts == 0 {
            return Err(Error::Config("max_lock_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}
