//! External model collaborators.
//!
//! The engine talks to language models only through these traits so that
//! scheduling and merging can be exercised without a network. The rig-core
//! backed implementation lives in [`anthropic`].

pub mod anthropic;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{AlignedWord, Mode, RecipeBundle, TranslationContext, Variant};
use crate::quality::ContrastiveConstraints;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    RateLimited,
    Timeout,
    /// Output could not be parsed.
    Malformed,
    /// Output parsed but failed a shape check (e.g. wrong arity).
    Validation,
    /// Will not succeed on retry (auth, bad request).
    Fatal,
}

impl std::fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpstreamErrorKind::RateLimited => "rate_limited",
            UpstreamErrorKind::Timeout => "timeout",
            UpstreamErrorKind::Malformed => "malformed",
            UpstreamErrorKind::Validation => "validation",
            UpstreamErrorKind::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != UpstreamErrorKind::Fatal
    }
}

/// Request to re-roll the single worst variant of a line.
#[derive(Debug, Clone)]
pub struct RegenerateRequest {
    pub source: String,
    /// Slot being replaced.
    pub worst: Variant,
    /// Siblings that stay as they are.
    pub good: Vec<Variant>,
    pub constraints: ContrastiveConstraints,
    pub context: TranslationContext,
    /// Number of candidates wanted.
    pub samples: usize,
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// Produce sibling variants for one source line.
    async fn translate(
        &self,
        source: &str,
        context: &TranslationContext,
        recipes: Option<&RecipeBundle>,
    ) -> Result<Vec<Variant>, UpstreamError>;

    /// Produce up to `request.samples` candidates for the worst slot.
    async fn regenerate_one(&self, request: &RegenerateRequest)
    -> Result<Vec<Variant>, UpstreamError>;
}

#[async_trait]
pub trait Aligner: Send + Sync {
    /// Word-level alignment for every variant text, in input order.
    async fn align(
        &self,
        source: &str,
        variants: &[String],
    ) -> Result<Vec<Vec<AlignedWord>>, UpstreamError>;
}

#[async_trait]
pub trait RecipeGenerator: Send + Sync {
    async fn generate_recipes(
        &self,
        context: &TranslationContext,
        mode: Mode,
    ) -> Result<RecipeBundle, UpstreamError>;
}

/// Bound an upstream call; elapsed time surfaces as a retryable timeout.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, UpstreamError>
where
    F: Future<Output = Result<T, UpstreamError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::new(
            UpstreamErrorKind::Timeout,
            format!("no response within {}ms", limit.as_millis()),
        )),
    }
}
