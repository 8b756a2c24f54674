//! Span helpers for ticks, chunk passes and recipe generation.

use opentelemetry::KeyValue;
use tracing::Span;

use super::metrics;
use crate::model::{ChunkIndex, ChunkStatus, JobId, Mode};

/// Start a span for one scheduler tick.
///
/// Outcome fields are declared empty and filled by the scheduler once the
/// tick has persisted.
pub fn start_tick_span(job_id: &JobId) -> Span {
    tracing::info_span!(
        "tick.advance",
        "job.id" = %job_id,
        "tick.chunks_processed" = tracing::field::Empty,
        "tick.lines_translated" = tracing::field::Empty,
        "tick.version" = tracing::field::Empty,
        "tick.cas_attempts" = tracing::field::Empty,
    )
}

pub fn start_chunk_span(job_id: &JobId, index: ChunkIndex, pending_lines: usize) -> Span {
    tracing::info_span!(
        "chunk.process",
        "job.id" = %job_id,
        "chunk.index" = index,
        "chunk.pending_lines" = pending_lines,
    )
}

pub fn start_recipe_span(job_id: &JobId, mode: Mode) -> Span {
    tracing::info_span!(
        "recipe.generate",
        "job.id" = %job_id,
        "recipe.mode" = %mode,
    )
}

/// Log a chunk status change on `span` and count it.
pub fn record_chunk_transition(span: &Span, index: ChunkIndex, from: ChunkStatus, to: ChunkStatus) {
    span.in_scope(|| {
        tracing::info!(chunk = index, from = %from, to = %to, "chunk_transition");
    });
    metrics::chunk_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
