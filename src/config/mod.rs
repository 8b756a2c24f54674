//! Typed configuration.
//!
//! Process settings come from environment variables and are loaded once at
//! startup. Sensitive values are wrapped in `SecretString` to keep them out
//! of logs. Engine tuning lives in an optional TOML file (see [`engine`]).

pub mod engine;

pub use engine::EngineConfig;

use crate::error::{Error, Result};
use secrecy::SecretString;

/// Default model used by the Anthropic collaborators.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub anthropic_api_key: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub model: String,
    /// Path to the engine TOML file, if any.
    pub engine_config_path: Option<std::path::PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            anthropic_api_key: SecretString::from(required_var("ANTHROPIC_API_KEY")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            model: std::env::var("STANZA_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            engine_config_path: std::env::var("STANZA_ENGINE_CONFIG").ok().map(Into::into),
        })
    }

    /// Engine settings from `STANZA_ENGINE_CONFIG`, or defaults.
    pub fn engine(&self) -> Result<EngineConfig> {
        match &self.engine_config_path {
            Some(path) => EngineConfig::load(path),
            None => Ok(EngineConfig::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
