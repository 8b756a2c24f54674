//! Job, chunk and line transitions.
//!
//! Everything here is a pure function over an in-memory [`Job`]. A tick
//! applies its computed outcomes through [`apply_outcomes`], and on a version
//! conflict applies the same outcomes again to the reloaded document, so
//! nothing in this module may call out or depend on prior attempts.

use chrono::Utc;
use tracing::warn;

use crate::config::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::model::{
    Chunk, ChunkIndex, ChunkStatus, Job, JobId, JobStatus, Line, NewJob, SourceLine,
    TranslationStatus,
};

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Build the initial document for a new job.
///
/// Lines are numbered from 1 across the whole poem. Every chunk starts
/// pending except the first, which is queued. The store assigns the version.
pub fn build_job(new: NewJob, config: &EngineConfig) -> Result<Job> {
    if new.chunks.is_empty() {
        return Err(Error::InvalidInput("a job needs at least one chunk".to_string()));
    }
    if let Some(i) = new.chunks.iter().position(|c| c.is_empty()) {
        return Err(Error::InvalidInput(format!("chunk {i} has no lines")));
    }
    let max_concurrent_chunks = new
        .max_concurrent_chunks
        .unwrap_or(config.scheduler.max_concurrent_chunks);
    let max_chunks_per_tick = new
        .max_chunks_per_tick
        .unwrap_or(config.scheduler.max_chunks_per_tick);
    if max_concurrent_chunks == 0 || max_chunks_per_tick == 0 {
        return Err(Error::InvalidInput("chunk limits must be at least 1".to_string()));
    }
    let max_retries = new.max_retries.unwrap_or(config.processing.max_retries);

    let mut next_line = 1u32;
    let chunks = new
        .chunks
        .into_iter()
        .enumerate()
        .map(|(index, texts)| {
            let source: Vec<SourceLine> = texts
                .into_iter()
                .map(|text| {
                    let line = SourceLine {
                        line_number: next_line,
                        text,
                    };
                    next_line += 1;
                    line
                })
                .collect();
            let chunk = Chunk {
                index,
                status: if index == 0 {
                    ChunkStatus::Queued
                } else {
                    ChunkStatus::Pending
                },
                total_lines: source.len(),
                lines_processed: 0,
                retries: 0,
                max_retries,
                source,
                lines: Vec::new(),
            };
            (index, chunk)
        })
        .collect::<std::collections::BTreeMap<_, _>>();

    let now = Utc::now();
    Ok(Job {
        id: JobId::new(),
        version: 0,
        status: JobStatus::Pending,
        context: new.context,
        max_concurrent_chunks,
        max_chunks_per_tick,
        queue: chunks.keys().copied().collect(),
        active: Vec::new(),
        chunks,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
    })
}

// ---------------------------------------------------------------------------
// Derived status
// ---------------------------------------------------------------------------

/// Aggregate counts, always recomputed from chunk states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingStatus {
    pub chunks_total: usize,
    pub pending: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Chunks marked completed whose lines are not all present and terminal.
    pub incomplete: usize,
    pub total_lines: usize,
    pub lines_processed: usize,
    pub lines_failed: usize,
}

impl ProcessingStatus {
    /// No chunk left to run and none claiming completion falsely.
    pub fn is_done(&self) -> bool {
        self.pending == 0 && self.queued == 0 && self.processing == 0 && self.incomplete == 0
    }
}

pub fn compute_processing_status(job: &Job) -> ProcessingStatus {
    let mut status = ProcessingStatus {
        chunks_total: job.chunks.len(),
        ..Default::default()
    };
    for chunk in job.chunks.values() {
        match chunk.status {
            ChunkStatus::Pending => status.pending += 1,
            ChunkStatus::Queued => status.queued += 1,
            ChunkStatus::Processing => status.processing += 1,
            ChunkStatus::Completed => status.completed += 1,
            ChunkStatus::Failed => status.failed += 1,
        }
        if chunk.status.is_terminal() && !chunk.all_lines_terminal() {
            status.incomplete += 1;
        }
        status.total_lines += chunk.total_lines;
        status.lines_processed += chunk.count_processed();
        status.lines_failed += chunk
            .lines
            .iter()
            .filter(|l| l.translation_status == TranslationStatus::Failed)
            .count();
    }
    status
}

// ---------------------------------------------------------------------------
// Queue management
// ---------------------------------------------------------------------------

/// Promote pending chunks to queued, in queue order, until the number of
/// queued chunks reaches `max_concurrent_chunks`. Returns promoted indices.
pub fn ensure_queued_capacity(job: &mut Job) -> Vec<ChunkIndex> {
    let queued = job
        .chunks
        .values()
        .filter(|c| c.status == ChunkStatus::Queued)
        .count();
    let room = job.max_concurrent_chunks.saturating_sub(queued);

    let mut promoted = Vec::new();
    for index in job.queue.clone() {
        if promoted.len() >= room {
            break;
        }
        if let Some(chunk) = job.chunks.get_mut(&index)
            && chunk.status == ChunkStatus::Pending
        {
            chunk.status = ChunkStatus::Queued;
            promoted.push(index);
        }
    }
    promoted
}

/// Drop terminal, unknown and duplicated indices from `queue` and `active`.
/// An index present in both stays only in `active`.
pub fn reconcile(job: &mut Job) {
    let live = |job: &Job, i: &ChunkIndex| job.chunks.get(i).is_some_and(|c| !c.status.is_terminal());

    let mut active = Vec::with_capacity(job.active.len());
    for i in &job.active {
        if live(job, i) && !active.contains(i) {
            active.push(*i);
        }
    }
    let mut queue = Vec::with_capacity(job.queue.len());
    for i in &job.queue {
        if live(job, i) && !active.contains(i) && !queue.contains(i) {
            queue.push(*i);
        }
    }
    // A live chunk in neither list would never be scheduled.
    for (i, chunk) in &job.chunks {
        if !chunk.status.is_terminal() && !active.contains(i) && !queue.contains(i) {
            warn!(job_id = %job.id, chunk = i, status = %chunk.status, "chunk missing from queue, re-adding");
            queue.push(*i);
        }
    }
    job.active = active;
    job.queue = queue;
}

/// Chunks to run this tick: active chunks first (resuming time-sliced work),
/// then new ones from the queue while concurrency allows.
pub fn select_chunks(job: &Job) -> Vec<ChunkIndex> {
    let per_tick = job.max_chunks_per_tick;
    let mut selected: Vec<ChunkIndex> = job
        .active
        .iter()
        .copied()
        .filter(|i| job.chunks.get(i).is_some_and(|c| !c.status.is_terminal()))
        .take(per_tick)
        .collect();

    let room = per_tick
        .saturating_sub(selected.len())
        .min(job.max_concurrent_chunks.saturating_sub(job.active.len()));
    selected.extend(
        job.queue
            .iter()
            .copied()
            .filter(|i| {
                job.chunks.get(i).is_some_and(|c| {
                    matches!(c.status, ChunkStatus::Pending | ChunkStatus::Queued)
                })
            })
            .take(room),
    );
    selected
}

// ---------------------------------------------------------------------------
// Line merge
// ---------------------------------------------------------------------------

/// Merge one line result into its chunk by `line_number`.
///
/// A terminal stored line is never replaced by a non-terminal one. Returns
/// whether the chunk changed. `lines_processed` is always recomputed.
pub fn merge_line(chunk: &mut Chunk, line: Line) -> Result<bool> {
    if !chunk.owns(line.line_number) {
        return Err(Error::InvalidInput(format!(
            "line {} does not belong to chunk {}",
            line.line_number, chunk.index
        )));
    }

    let changed = match chunk.lines.iter_mut().find(|l| l.line_number == line.line_number) {
        Some(existing) => {
            if existing.translation_status.is_terminal() && !line.translation_status.is_terminal() {
                false
            } else if *existing == line {
                false
            } else {
                *existing = line;
                true
            }
        }
        None => {
            chunk.lines.push(line);
            chunk.lines.sort_by_key(|l| l.line_number);
            true
        }
    };
    chunk.lines_processed = chunk.count_processed();
    Ok(changed)
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

pub fn transition_chunk(chunk: &mut Chunk, to: ChunkStatus) -> Result<ChunkStatus> {
    let from = chunk.status;
    if !from.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    chunk.status = to;
    Ok(from)
}

pub fn transition_job(job: &mut Job, to: JobStatus) -> Result<()> {
    if !job.status.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            from: job.status.to_string(),
            to: to.to_string(),
        });
    }
    let now = Utc::now();
    match to {
        JobStatus::Processing => job.started_at = Some(now),
        JobStatus::Completed | JobStatus::Failed => job.completed_at = Some(now),
        JobStatus::Pending => {}
    }
    job.status = to;
    Ok(())
}

/// Finish the job if nothing is left to run. Returns true if it is terminal.
///
/// Chunk states are scanned on their own rather than trusting empty
/// `queue`/`active`, and a chunk marked completed with missing lines keeps
/// the job open.
pub fn mark_completed_if_done(job: &mut Job) -> Result<bool> {
    if job.status.is_terminal() {
        return Ok(true);
    }

    for chunk in job.chunks.values() {
        if chunk.status.is_terminal() && !chunk.all_lines_terminal() {
            warn!(
                job_id = %job.id,
                chunk = chunk.index,
                total_lines = chunk.total_lines,
                present = chunk.count_processed(),
                "chunk marked {} but has unfinished lines",
                chunk.status
            );
        }
    }

    let status = compute_processing_status(job);
    if !status.is_done() || !job.active.is_empty() || !job.queue.is_empty() {
        return Ok(false);
    }

    if job.status == JobStatus::Pending {
        transition_job(job, JobStatus::Processing)?;
    }
    let to = if status.failed == status.chunks_total {
        JobStatus::Failed
    } else {
        JobStatus::Completed
    };
    transition_job(job, to)?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Applying a tick
// ---------------------------------------------------------------------------

/// What one chunk pass produced. Independent of the document it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutcome {
    pub index: ChunkIndex,
    pub lines: Vec<Line>,
    /// At least one line hit a retryable failure in this pass.
    pub retry_consumed: bool,
    /// The tick deadline stopped the pass before every line was attempted.
    pub deadline_hit: bool,
}

/// Effect of [`apply_outcomes`] on one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplySummary {
    pub chunks_processed: usize,
    pub chunks_completed: usize,
    pub chunks_failed: usize,
    pub lines_translated: usize,
    pub lines_failed: usize,
    pub transitions: Vec<(ChunkIndex, ChunkStatus, ChunkStatus)>,
}

/// Apply chunk outcomes to `job`.
///
/// Chunks that are no longer live are skipped. A chunk that is not active is
/// activated if concurrency allows; otherwise its lines are still merged but
/// it stays where it is unless the merge finishes it.
pub fn apply_outcomes(job: &mut Job, outcomes: &[ChunkOutcome]) -> Result<ApplySummary> {
    reconcile(job);
    ensure_queued_capacity(job);

    let mut summary = ApplySummary::default();
    for outcome in outcomes {
        let Some(chunk) = job.chunks.get(&outcome.index) else {
            warn!(job_id = %job.id, chunk = outcome.index, "outcome for unknown chunk");
            continue;
        };
        if chunk.status.is_terminal() {
            continue;
        }

        let is_active = job.active.contains(&outcome.index);
        let can_activate = is_active || job.active.len() < job.max_concurrent_chunks;
        let id = job.id;
        let Some(chunk) = job.chunks.get_mut(&outcome.index) else {
            continue;
        };

        let mut changed = false;
        for line in &outcome.lines {
            changed |= merge_line(chunk, line.clone())?;
        }
        if outcome.retry_consumed {
            chunk.retries = chunk.retries.saturating_add(1);
        }
        let finished = chunk.all_lines_terminal();

        if !can_activate && !finished {
            if changed {
                warn!(job_id = %id, chunk = outcome.index, "no capacity to activate chunk, lines merged only");
            }
            continue;
        }

        summary.chunks_processed += 1;
        summary.lines_translated += outcome
            .lines
            .iter()
            .filter(|l| l.translation_status == TranslationStatus::Translated)
            .count();
        summary.lines_failed += outcome
            .lines
            .iter()
            .filter(|l| l.translation_status == TranslationStatus::Failed)
            .count();

        if chunk.status != ChunkStatus::Processing {
            let from = transition_chunk(chunk, ChunkStatus::Processing)?;
            summary.transitions.push((outcome.index, from, ChunkStatus::Processing));
        }

        if finished {
            let to = if chunk.all_lines_failed() {
                summary.chunks_failed += 1;
                ChunkStatus::Failed
            } else {
                summary.chunks_completed += 1;
                ChunkStatus::Completed
            };
            let from = transition_chunk(chunk, to)?;
            summary.transitions.push((outcome.index, from, to));
            job.active.retain(|i| *i != outcome.index);
            job.queue.retain(|i| *i != outcome.index);
        } else if !is_active {
            job.queue.retain(|i| *i != outcome.index);
            job.active.push(outcome.index);
        }
    }

    if summary.chunks_processed > 0 && job.status == JobStatus::Pending {
        transition_job(job, JobStatus::Processing)?;
    }

    ensure_queued_capacity(job);
    mark_completed_if_done(job)?;
    Ok(summary)
}

/// Whether another tick could move this job forward.
pub fn has_work_remaining(job: &Job) -> bool {
    !job.status.is_terminal()
        && (!job.queue.is_empty()
            || !job.active.is_empty()
            || job.chunks.values().any(|c| !c.status.is_terminal()))
}

// ---------------------------------------------------------------------------
// Monotonicity
// ---------------------------------------------------------------------------

/// Compare what a tick meant to write with what the store now holds.
/// Returns one message per regression.
pub fn check_monotonicity(intended: &Job, verified: &Job) -> Vec<String> {
    let mut violations = Vec::new();
    if verified.version < intended.version {
        violations.push(format!(
            "version went from {} to {}",
            intended.version, verified.version
        ));
    }
    for (index, want) in &intended.chunks {
        let Some(got) = verified.chunks.get(index) else {
            violations.push(format!("chunk {index} disappeared"));
            continue;
        };
        if got.lines_processed < want.lines_processed {
            violations.push(format!(
                "chunk {index} lines_processed went from {} to {}",
                want.lines_processed, got.lines_processed
            ));
        }
        if got.lines.len() < want.lines.len() {
            violations.push(format!(
                "chunk {index} lines went from {} to {}",
                want.lines.len(),
                got.lines.len()
            ));
        }
        if want.status == ChunkStatus::Completed && !got.status.is_terminal() {
            violations.push(format!("chunk {index} regressed from completed to {}", got.status));
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LineQuality, Mode, TranslationContext, Variant};

    fn job(chunks: &[usize], max_concurrent: usize) -> Job {
        let texts = chunks
            .iter()
            .map(|n| (0..*n).map(|i| format!("line {i}")).collect())
            .collect();
        let new = NewJob::new(TranslationContext::new("fr", "en", Mode::Balanced), texts)
            .max_concurrent_chunks(max_concurrent);
        build_job(new, &EngineConfig::default()).unwrap()
    }

    fn translated(n: u32) -> Line {
        Line::translated(
            n,
            vec![Variant::new("A", format!("v{n}"))],
            LineQuality {
                max_similarity: 0.1,
                threshold: 0.7,
                regenerated: false,
                still_failing: false,
            },
        )
    }

    #[test]
    fn build_numbers_lines_globally_and_queues_first_chunk() {
        let job = job(&[2, 3], 1);
        assert_eq!(job.queue, vec![0, 1]);
        assert_eq!(job.chunks[&0].status, ChunkStatus::Queued);
        assert_eq!(job.chunks[&1].status, ChunkStatus::Pending);
        let numbers: Vec<u32> = job.chunks[&1].source.iter().map(|s| s.line_number).collect();
        assert_eq!(numbers, vec![3, 4, 5]);
    }

    #[test]
    fn build_rejects_empty_chunks() {
        let new = NewJob::new(
            TranslationContext::new("fr", "en", Mode::Balanced),
            vec![vec!["a".into()], vec![]],
        );
        assert!(matches!(
            build_job(new, &EngineConfig::default()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut job = job(&[3], 1);
        let chunk = job.chunks.get_mut(&0).unwrap();
        let line = translated(2);
        assert!(merge_line(chunk, line.clone()).unwrap());
        let before = chunk.clone();
        assert!(!merge_line(chunk, line).unwrap());
        assert_eq!(*chunk, before);
        assert_eq!(chunk.lines_processed, 1);
    }

    #[test]
    fn out_of_order_merge_sorts_by_line_number() {
        let mut job = job(&[6], 1);
        let chunk = job.chunks.get_mut(&0).unwrap();
        merge_line(chunk, translated(5)).unwrap();
        merge_line(chunk, translated(2)).unwrap();
        merge_line(chunk, Line::pending(3, "timeout")).unwrap();
        let order: Vec<u32> = chunk.lines.iter().map(|l| l.line_number).collect();
        assert_eq!(order, vec![2, 3, 5]);
        assert_eq!(chunk.lines_processed, 2);
    }

    #[test]
    fn pending_never_overwrites_terminal_line() {
        let mut job = job(&[2], 1);
        let chunk = job.chunks.get_mut(&0).unwrap();
        merge_line(chunk, translated(1)).unwrap();
        assert!(!merge_line(chunk, Line::pending(1, "late retry")).unwrap());
        assert_eq!(
            chunk.line(1).unwrap().translation_status,
            TranslationStatus::Translated
        );
    }

    #[test]
    fn merge_rejects_foreign_line() {
        let mut job = job(&[2, 2], 1);
        let chunk = job.chunks.get_mut(&0).unwrap();
        assert!(merge_line(chunk, translated(4)).is_err());
    }

    #[test]
    fn ensure_queued_capacity_is_idempotent() {
        let mut job = job(&[1, 1, 1, 1], 3);
        assert_eq!(ensure_queued_capacity(&mut job), vec![1, 2]);
        assert!(ensure_queued_capacity(&mut job).is_empty());
        assert_eq!(job.chunks[&3].status, ChunkStatus::Pending);
    }

    #[test]
    fn completed_chunk_with_missing_lines_blocks_completion() {
        let mut job = job(&[4], 1);
        let chunk = job.chunks.get_mut(&0).unwrap();
        for n in 1..=3 {
            merge_line(chunk, translated(n)).unwrap();
        }
        chunk.status = ChunkStatus::Completed;
        job.queue.clear();
        job.status = JobStatus::Processing;

        let status = compute_processing_status(&job);
        assert_eq!(status.incomplete, 1);
        assert!(!status.is_done());
        assert!(!mark_completed_if_done(&mut job).unwrap());
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn select_resumes_active_before_queue() {
        let mut job = job(&[1, 1, 1], 2);
        job.chunks.get_mut(&1).unwrap().status = ChunkStatus::Processing;
        job.active = vec![1];
        job.queue = vec![0, 2];
        assert_eq!(select_chunks(&job), vec![1, 0]);
    }

    #[test]
    fn apply_completes_chunk_and_job() {
        let mut job = job(&[2], 1);
        let outcome = ChunkOutcome {
            index: 0,
            lines: vec![translated(2), translated(1)],
            retry_consumed: false,
            deadline_hit: false,
        };
        let summary = apply_outcomes(&mut job, &[outcome]).unwrap();
        assert_eq!(summary.chunks_completed, 1);
        assert_eq!(summary.lines_translated, 2);
        assert_eq!(job.chunks[&0].status, ChunkStatus::Completed);
        assert!(job.active.is_empty() && job.queue.is_empty());
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn partial_outcome_keeps_chunk_active() {
        let mut job = job(&[3, 1], 1);
        let outcome = ChunkOutcome {
            index: 0,
            lines: vec![translated(1)],
            retry_consumed: false,
            deadline_hit: true,
        };
        apply_outcomes(&mut job, &[outcome]).unwrap();
        assert_eq!(job.chunks[&0].status, ChunkStatus::Processing);
        assert_eq!(job.active, vec![0]);
        assert_eq!(job.queue, vec![1]);
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn all_failed_lines_fail_chunk_and_job() {
        let mut job = job(&[1], 1);
        let outcome = ChunkOutcome {
            index: 0,
            lines: vec![Line::failed(1, "fatal")],
            retry_consumed: false,
            deadline_hit: false,
        };
        apply_outcomes(&mut job, &[outcome]).unwrap();
        assert_eq!(job.chunks[&0].status, ChunkStatus::Failed);
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn monotonicity_flags_regressions() {
        let mut intended = job(&[2], 1);
        intended.version = 4;
        let chunk = intended.chunks.get_mut(&0).unwrap();
        merge_line(chunk, translated(1)).unwrap();
        merge_line(chunk, translated(2)).unwrap();
        chunk.status = ChunkStatus::Completed;

        let mut verified = intended.clone();
        assert!(check_monotonicity(&intended, &verified).is_empty());

        verified.version = 3;
        let chunk = verified.chunks.get_mut(&0).unwrap();
        chunk.lines.pop();
        chunk.lines_processed = 1;
        chunk.status = ChunkStatus::Processing;
        assert_eq!(check_monotonicity(&intended, &verified).len(), 4);
    }

    #[test]
    fn reconcile_prunes_drift() {
        let mut job = job(&[1, 1, 1], 3);
        job.chunks.get_mut(&0).unwrap().status = ChunkStatus::Completed;
        job.active = vec![1, 1, 0];
        job.queue = vec![0, 1, 2, 2];
        reconcile(&mut job);
        assert_eq!(job.active, vec![1]);
        assert_eq!(job.queue, vec![2]);
    }
}
