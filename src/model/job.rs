//! Job, chunk and line records.
//!
//! The whole job is one document: it is loaded, mutated in memory and
//! swapped back under a version check. Nothing here performs I/O.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::TranslationContext;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 chars of the UUID, for log lines and tables.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

pub type ChunkIndex = usize;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle of the whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(crate::error::Error::InvalidInput(format!("unknown job status: {s}"))),
        }
    }
}

/// Lifecycle of one chunk. Strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Waiting in the queue, not yet promoted.
    Pending,
    /// Promoted; eligible for the next tick.
    Queued,
    /// Being advanced; may span several ticks.
    Processing,
    Completed,
    /// Every line failed permanently.
    Failed,
}

impl ChunkStatus {
    pub fn can_transition_to(self, to: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (self, to),
            (Pending, Queued)
                | (Pending, Processing)
                | (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Failed)
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Queued => "queued",
            ChunkStatus::Processing => "processing",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationStatus {
    Pending,
    Translated,
    Failed,
}

impl TranslationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TranslationStatus::Translated | TranslationStatus::Failed)
    }
}

impl std::fmt::Display for TranslationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TranslationStatus::Pending => "pending",
            TranslationStatus::Translated => "translated",
            TranslationStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentStatus {
    Pending,
    Aligned,
    Failed,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Root aggregate, persisted as a single versioned document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Strictly increases on every persisted write. Assigned by the store.
    pub version: u64,

    pub status: JobStatus,

    pub context: TranslationContext,

    pub max_concurrent_chunks: usize,
    pub max_chunks_per_tick: usize,

    /// Chunk indices not yet taken by a tick, in processing order.
    pub queue: Vec<ChunkIndex>,

    /// Chunk indices currently being advanced.
    pub active: Vec<ChunkIndex>,

    pub chunks: BTreeMap<ChunkIndex, Chunk>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn total_lines(&self) -> usize {
        self.chunks.values().map(|c| c.total_lines).sum()
    }

    pub fn lines_processed(&self) -> usize {
        self.chunks.values().map(|c| c.lines_processed).sum()
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// A source line as submitted. `line_number` is global across the poem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLine {
    pub line_number: u32,
    pub text: String,
}

/// A stanza: the unit of scheduling and retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: ChunkIndex,
    pub status: ChunkStatus,
    pub total_lines: usize,

    /// Derived from `lines`; recomputed on every merge, never trusted as input.
    pub lines_processed: usize,

    /// Passes in which at least one line hit a retryable failure.
    pub retries: u32,
    pub max_retries: u32,

    pub source: Vec<SourceLine>,

    /// Results keyed by `line_number`, kept sorted.
    #[serde(default)]
    pub lines: Vec<Line>,
}

impl Chunk {
    pub fn owns(&self, line_number: u32) -> bool {
        self.source.iter().any(|s| s.line_number == line_number)
    }

    pub fn line(&self, line_number: u32) -> Option<&Line> {
        self.lines.iter().find(|l| l.line_number == line_number)
    }

    /// Count of lines with a terminal translation status.
    pub fn count_processed(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| l.translation_status.is_terminal())
            .count()
    }

    /// Source lines that still need work, in line order.
    pub fn unfinished_source(&self) -> Vec<SourceLine> {
        self.source
            .iter()
            .filter(|s| {
                !self
                    .line(s.line_number)
                    .is_some_and(|l| l.translation_status.is_terminal())
            })
            .cloned()
            .collect()
    }

    /// Every owned line is present with a terminal status.
    pub fn all_lines_terminal(&self) -> bool {
        let terminal_owned = self
            .source
            .iter()
            .filter(|s| {
                self.line(s.line_number)
                    .is_some_and(|l| l.translation_status.is_terminal())
            })
            .count();
        terminal_owned == self.total_lines && self.source.len() == self.total_lines
    }

    pub fn all_lines_failed(&self) -> bool {
        !self.lines.is_empty()
            && self
                .lines
                .iter()
                .all(|l| l.translation_status == TranslationStatus::Failed)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }
}

// ---------------------------------------------------------------------------
// Line / Variant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub line_number: u32,
    pub translation_status: TranslationStatus,
    #[serde(default)]
    pub variants: Vec<Variant>,
    pub alignment_status: AlignmentStatus,
    #[serde(default)]
    pub quality: Option<LineQuality>,
    /// Last failure seen for this line, kept for display.
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Line {
    pub fn translated(line_number: u32, variants: Vec<Variant>, quality: LineQuality) -> Self {
        Self {
            line_number,
            translation_status: TranslationStatus::Translated,
            variants,
            alignment_status: AlignmentStatus::Aligned,
            quality: Some(quality),
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// A retryable failure: left for a later tick.
    pub fn pending(line_number: u32, error: impl Into<String>) -> Self {
        Self {
            line_number,
            translation_status: TranslationStatus::Pending,
            variants: Vec::new(),
            alignment_status: AlignmentStatus::Pending,
            quality: None,
            last_error: Some(error.into()),
            updated_at: Utc::now(),
        }
    }

    pub fn failed(line_number: u32, error: impl Into<String>) -> Self {
        Self {
            line_number,
            translation_status: TranslationStatus::Failed,
            variants: Vec::new(),
            alignment_status: AlignmentStatus::Failed,
            quality: None,
            last_error: Some(error.into()),
            updated_at: Utc::now(),
        }
    }
}

/// One sibling translation of a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    /// "A", "B", "C", ...
    pub label: String,
    pub text: String,
    #[serde(default)]
    pub self_report: Option<SelfReport>,
    #[serde(default)]
    pub alignment: Option<Vec<AlignedWord>>,
}

impl Variant {
    pub fn new(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            text: text.into(),
            self_report: None,
            alignment: None,
        }
    }

    pub fn with_approach(mut self, approach: impl Into<String>) -> Self {
        self.self_report
            .get_or_insert_with(SelfReport::default)
            .approach = Some(approach.into());
        self
    }
}

/// What the model says about its own variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelfReport {
    /// Short label of the approach taken (e.g. "literal", "imagistic").
    pub approach: Option<String>,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedWord {
    pub source: String,
    pub target: String,
}

/// Outcome of the diversity gate for a translated line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineQuality {
    pub max_similarity: f64,
    pub threshold: f64,
    pub regenerated: bool,
    /// Salvage kept its best candidate but the gate still does not pass.
    pub still_failing: bool,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a new job. The engine's public API for submitting a poem.
pub struct NewJob {
    pub(crate) context: TranslationContext,
    pub(crate) chunks: Vec<Vec<String>>,
    pub(crate) max_concurrent_chunks: Option<usize>,
    pub(crate) max_chunks_per_tick: Option<usize>,
    pub(crate) max_retries: Option<u32>,
}

impl NewJob {
    /// `chunks` are stanzas, each a list of source lines.
    pub fn new(context: TranslationContext, chunks: Vec<Vec<String>>) -> Self {
        Self {
            context,
            chunks,
            max_concurrent_chunks: None,
            max_chunks_per_tick: None,
            max_retries: None,
        }
    }

    pub fn max_concurrent_chunks(mut self, n: usize) -> Self {
        self.max_concurrent_chunks = Some(n);
        self
    }

    pub fn max_chunks_per_tick(mut self, n: usize) -> Self {
        self.max_chunks_per_tick = Some(n);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }
}

/// Split plain text into stanzas on blank lines. Lines are trimmed.
pub fn split_stanzas(text: &str) -> Vec<Vec<String>> {
    let mut stanzas = Vec::new();
    let mut current = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                stanzas.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line.to_string());
        }
    }
    if !current.is_empty() {
        stanzas.push(current);
    }
    stanzas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stanzas_split_on_blank_lines() {
        let text = "  first line\nsecond line\n\n\nthird line\n   \nfourth\n";
        assert_eq!(
            split_stanzas(text),
            vec![
                vec!["first line".to_string(), "second line".to_string()],
                vec!["third line".to_string()],
                vec!["fourth".to_string()],
            ]
        );
        assert!(split_stanzas("\n\n").is_empty());
    }

    #[test]
    fn chunk_status_only_moves_forward() {
        assert!(ChunkStatus::Queued.can_transition_to(ChunkStatus::Processing));
        assert!(!ChunkStatus::Completed.can_transition_to(ChunkStatus::Processing));
        assert!(!ChunkStatus::Processing.can_transition_to(ChunkStatus::Queued));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
    }

    #[test]
    fn job_id_round_trips_through_display() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short().len(), 8);
    }
}
