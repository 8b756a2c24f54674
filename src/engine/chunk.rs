//! One processing pass over a chunk.
//!
//! Unfinished lines run in parallel under a line-concurrency semaphore. Each
//! line is translated, gated, salvaged at most once and aligned. The pass
//! stops starting new lines once the tick deadline is reached; lines already
//! in flight finish.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, warn};

use super::state::ChunkOutcome;
use crate::config::engine::ProcessingConfig;
use crate::llm::{Aligner, Translator, UpstreamError, UpstreamErrorKind, with_timeout};
use crate::model::{
    AlignedWord, Chunk, JobId, Line, LineQuality, RecipeBundle, SourceLine, TranslationContext,
    Variant,
};
use crate::quality::diversity::tokenize;
use crate::quality::{DiversityGate, Regenerator};
use crate::telemetry::{job::start_chunk_span, metrics};

#[derive(Clone)]
pub struct ChunkProcessor {
    translator: Arc<dyn Translator>,
    aligner: Arc<dyn Aligner>,
    gate: DiversityGate,
    regenerator: Arc<Regenerator>,
    line_concurrency: usize,
    call_timeout: Duration,
}

impl ChunkProcessor {
    pub fn new(
        translator: Arc<dyn Translator>,
        aligner: Arc<dyn Aligner>,
        gate: DiversityGate,
        regenerator: Arc<Regenerator>,
        config: &ProcessingConfig,
    ) -> Self {
        Self {
            translator,
            aligner,
            gate,
            regenerator,
            line_concurrency: config.line_concurrency.max(1),
            call_timeout: config.call_timeout(),
        }
    }

    /// Run one pass over the chunk's unfinished lines.
    ///
    /// Never fails: upstream errors become pending or failed lines according
    /// to the chunk's retry budget.
    pub async fn process(
        &self,
        job_id: JobId,
        chunk: &Chunk,
        context: &TranslationContext,
        recipes: Option<Arc<RecipeBundle>>,
        deadline: Instant,
    ) -> ChunkOutcome {
        let pending = chunk.unfinished_source();
        let span = start_chunk_span(&job_id, chunk.index, pending.len());
        let exhausted = chunk.retries_exhausted();

        async move {
            let semaphore = Arc::new(Semaphore::new(self.line_concurrency));
            let mut tasks = JoinSet::new();
            let mut deadline_hit = false;

            for source in pending {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                if Instant::now() >= deadline {
                    debug!(line = source.line_number, "deadline reached, leaving remaining lines");
                    deadline_hit = true;
                    break;
                }
                let this = self.clone();
                let context = context.clone();
                let recipes = recipes.clone();
                tasks.spawn(
                    async move {
                        let number = source.line_number;
                        let result = this.process_line(&source, &context, recipes.as_deref()).await;
                        drop(permit);
                        (number, result)
                    }
                    .in_current_span(),
                );
            }

            let mut lines = Vec::new();
            let mut retry_consumed = false;
            while let Some(joined) = tasks.join_next().await {
                let (number, result) = match joined {
                    Ok(r) => r,
                    Err(e) => {
                        error!(error = %e, "line task panicked");
                        continue;
                    }
                };
                let line = match result {
                    Ok(line) => line,
                    Err(e) if e.is_retryable() && !exhausted => {
                        warn!(line = number, error = %e, "line failed, will retry");
                        retry_consumed = true;
                        Line::pending(number, e.to_string())
                    }
                    Err(e) => {
                        warn!(line = number, error = %e, "line failed permanently");
                        Line::failed(number, e.to_string())
                    }
                };
                metrics::lines_processed()
                    .add(1, &[KeyValue::new("status", line.translation_status.to_string())]);
                lines.push(line);
            }
            lines.sort_by_key(|l| l.line_number);

            ChunkOutcome {
                index: chunk.index,
                lines,
                retry_consumed,
                deadline_hit,
            }
        }
        .instrument(span)
        .await
    }

    async fn process_line(
        &self,
        source: &SourceLine,
        context: &TranslationContext,
        recipes: Option<&RecipeBundle>,
    ) -> Result<Line, UpstreamError> {
        let mut variants = with_timeout(
            self.call_timeout,
            self.translator.translate(&source.text, context, recipes),
        )
        .await?;
        if variants.is_empty() {
            return Err(UpstreamError::new(
                UpstreamErrorKind::Validation,
                "translator returned no variants",
            ));
        }

        let line_tokens = tokenize(&source.text).len();
        let verdict = self.gate.evaluate(&variants, context.mode, line_tokens);
        let quality = match verdict.worst_index {
            Some(worst) if !verdict.pass => {
                self.salvage(source, &mut variants, worst, context, verdict.threshold)
                    .await;
                let after = self.gate.evaluate(&variants, context.mode, line_tokens);
                LineQuality {
                    max_similarity: after.max_similarity,
                    threshold: after.threshold,
                    regenerated: true,
                    still_failing: !after.pass,
                }
            }
            _ => LineQuality {
                max_similarity: verdict.max_similarity,
                threshold: verdict.threshold,
                regenerated: false,
                still_failing: false,
            },
        };

        self.attach_alignments(&source.text, &mut variants).await?;
        Ok(Line::translated(source.line_number, variants, quality))
    }

    /// Replace the worst variant in place. An upstream failure keeps the
    /// originals; the line is then recorded as still failing.
    async fn salvage(
        &self,
        source: &SourceLine,
        variants: &mut [Variant],
        worst: usize,
        context: &TranslationContext,
        threshold: f64,
    ) {
        match self
            .regenerator
            .salvage(&source.text, variants, worst, context, threshold)
            .await
        {
            Ok(salvage) => {
                metrics::regenerations()
                    .add(1, &[KeyValue::new("cleared", salvage.cleared.to_string())]);
                variants[worst] = salvage.variant;
            }
            Err(e) => {
                warn!(line = source.line_number, error = %e, "regeneration failed, keeping originals");
                metrics::regenerations().add(1, &[KeyValue::new("cleared", "false")]);
            }
        }
    }

    /// Align all variants in one call, falling back to one call per variant
    /// when the batch reply fails validation.
    async fn attach_alignments(
        &self,
        source: &str,
        variants: &mut [Variant],
    ) -> Result<(), UpstreamError> {
        let texts: Vec<String> = variants.iter().map(|v| v.text.clone()).collect();
        let batch = with_timeout(self.call_timeout, self.aligner.align(source, &texts)).await;

        let alignments: Vec<Vec<AlignedWord>> = match batch {
            Ok(a) if a.len() == texts.len() => a,
            Ok(_) | Err(UpstreamError { kind: UpstreamErrorKind::Validation, .. }) => {
                debug!("batched alignment rejected, aligning per variant");
                let mut each = Vec::with_capacity(texts.len());
                for text in &texts {
                    let single = std::slice::from_ref(text);
                    let mut one =
                        with_timeout(self.call_timeout, self.aligner.align(source, single)).await?;
                    if one.len() != 1 {
                        return Err(UpstreamError::new(
                            UpstreamErrorKind::Validation,
                            format!("expected 1 alignment, got {}", one.len()),
                        ));
                    }
                    each.push(one.remove(0));
                }
                each
            }
            Err(e) => return Err(e),
        };

        for (variant, alignment) in variants.iter_mut().zip(alignments) {
            variant.alignment = Some(alignment);
        }
        Ok(())
    }
}
