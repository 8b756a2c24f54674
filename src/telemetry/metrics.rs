//! Metric instrument factories for stanza-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"stanza-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for stanza-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("stanza-rs")
}

/// Counter: ticks run.
/// Labels: `result` ("advanced" | "lock_busy" | "already_complete" | "error").
pub fn tick_count() -> Counter<u64> {
    meter()
        .u64_counter("stanza.tick.count")
        .with_description("Number of scheduler ticks")
        .build()
}

/// Histogram: wall time of one tick in milliseconds.
pub fn tick_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("stanza.tick.duration_ms")
        .with_description("Tick duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: compare-and-swap attempts that lost to another writer.
pub fn cas_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("stanza.store.cas_conflicts")
        .with_description("Version conflicts while persisting a job")
        .build()
}

/// Counter: lines finished by a chunk pass.
/// Labels: `status` ("translated" | "failed" | "pending").
pub fn lines_processed() -> Counter<u64> {
    meter()
        .u64_counter("stanza.lines.processed")
        .with_description("Lines handled by chunk processing")
        .build()
}

/// Counter: salvage regenerations.
/// Labels: `cleared` ("true" | "false").
pub fn regenerations() -> Counter<u64> {
    meter()
        .u64_counter("stanza.quality.regenerations")
        .with_description("Worst-variant regenerations")
        .build()
}

/// Counter: lock acquisitions that found the lock held.
/// Labels: `lock` ("tick" | "recipe").
pub fn lock_contention() -> Counter<u64> {
    meter()
        .u64_counter("stanza.lock.contention")
        .with_description("Lock acquisitions refused because the lock was held")
        .build()
}

/// Counter: persisted writes that moved progress backwards.
pub fn monotonicity_violations() -> Counter<u64> {
    meter()
        .u64_counter("stanza.monotonicity.violations")
        .with_description("Writes whose reloaded state regressed")
        .build()
}

/// Counter: chunk status transitions.
/// Labels: `from`, `to`.
pub fn chunk_transitions() -> Counter<u64> {
    meter()
        .u64_counter("stanza.chunk.transitions")
        .with_description("Number of chunk status transitions")
        .build()
}

/// Counter: LLM token usage.
/// Labels: `model`, `provider`, `direction` ("input" | "output").
pub fn llm_tokens() -> Counter<u64> {
    meter()
        .u64_counter("stanza.llm.tokens")
        .with_description("LLM token usage")
        .build()
}

/// Counter: ticks that ran without recipes because generation failed.
/// Labels: `kind` (upstream error kind).
pub fn recipe_fallbacks() -> Counter<u64> {
    meter()
        .u64_counter("stanza.recipe.fallbacks")
        .with_description("Ticks that translated without recipes after a generation failure")
        .build()
}
