//! Salvage regeneration of the single worst variant.
//!
//! One pass per line: ask for K candidates that avoid the openings and
//! shapes the good siblings already use, keep the best one, never loop.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::diversity::{DiversityGate, tokenize};
use crate::config::engine::{PerMode, RegenerationConfig};
use crate::llm::{RegenerateRequest, Translator, UpstreamError, with_timeout};
use crate::model::{TranslationContext, Variant};

/// Tokens of a good variant's opening that a candidate must not reuse.
const OPENING_TOKENS: usize = 2;

/// Score penalty for a candidate that ignores a forbidden opening.
const OPENING_PENALTY: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContrastiveConstraints {
    /// Openings already used by the good variants, lowercased.
    pub forbidden_openings: Vec<String>,
    /// Structural signatures already used, see [`structural_signature`].
    pub forbidden_patterns: Vec<String>,
    /// Similarity ceiling the new candidate should stay under.
    pub max_similarity: f64,
}

impl ContrastiveConstraints {
    pub fn from_good(good: &[Variant], max_similarity: f64) -> Self {
        let mut forbidden_openings: Vec<String> = good
            .iter()
            .map(|v| opening(&v.text))
            .filter(|o| !o.is_empty())
            .collect();
        forbidden_openings.dedup();
        let mut forbidden_patterns: Vec<String> =
            good.iter().map(|v| structural_signature(&v.text)).collect();
        forbidden_patterns.sort();
        forbidden_patterns.dedup();
        Self {
            forbidden_openings,
            forbidden_patterns,
            max_similarity,
        }
    }

    pub fn violates_opening(&self, text: &str) -> bool {
        let o = opening(text);
        !o.is_empty() && self.forbidden_openings.contains(&o)
    }
}

/// First few lowercased tokens of a text.
pub fn opening(text: &str) -> String {
    tokenize(text)
        .into_iter()
        .take(OPENING_TOKENS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Coarse shape of a line: clause count and closing punctuation.
pub fn structural_signature(text: &str) -> String {
    let trimmed = text.trim();
    let clauses = trimmed
        .split([',', ';', ':', '—'])
        .filter(|s| !s.trim().is_empty())
        .count()
        .max(1);
    let end = match trimmed.chars().last() {
        Some(c @ ('?' | '!' | '.' | ',' | ';' | ':' | '…')) => c.to_string(),
        _ => "none".to_string(),
    };
    format!("clauses={clauses};end={end}")
}

/// What salvage settled on for the worst slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Salvage {
    /// Replacement, carrying the worst slot's label.
    pub variant: Variant,
    /// Highest similarity of the replacement against the good siblings.
    pub similarity: f64,
    /// The replacement is under the threshold.
    pub cleared: bool,
    pub candidates: usize,
}

pub struct Regenerator {
    translator: Arc<dyn Translator>,
    gate: DiversityGate,
    samples: PerMode<usize>,
    call_timeout: Duration,
}

impl Regenerator {
    pub fn new(
        translator: Arc<dyn Translator>,
        gate: DiversityGate,
        config: &RegenerationConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            translator,
            gate,
            samples: config.samples,
            call_timeout,
        }
    }

    /// Replace `variants[worst_index]` with the best of K fresh candidates.
    ///
    /// The best candidate is kept even when it does not clear `threshold`.
    /// With no usable candidates the original variant comes back uncleared.
    pub async fn salvage(
        &self,
        source: &str,
        variants: &[Variant],
        worst_index: usize,
        context: &TranslationContext,
        threshold: f64,
    ) -> Result<Salvage, UpstreamError> {
        let worst = variants[worst_index].clone();
        let good: Vec<Variant> = variants
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != worst_index)
            .map(|(_, v)| v.clone())
            .collect();
        let constraints = ContrastiveConstraints::from_good(&good, threshold);
        let samples = self.samples.get(context.mode).max(1);

        let request = RegenerateRequest {
            source: source.to_string(),
            worst: worst.clone(),
            good: good.clone(),
            constraints: constraints.clone(),
            context: context.clone(),
            samples,
        };
        let candidates = with_timeout(self.call_timeout, self.translator.regenerate_one(&request))
            .await?;

        let scored = candidates
            .into_iter()
            .filter(|c| !c.text.trim().is_empty())
            .map(|c| {
                let similarity = self.gate.max_similarity_against(&c, &good);
                let penalty = if constraints.violates_opening(&c.text) {
                    OPENING_PENALTY
                } else {
                    0.0
                };
                (similarity + penalty, similarity, c)
            })
            .collect::<Vec<_>>();
        let count = scored.len();

        let best = scored
            .into_iter()
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let Some((_, similarity, mut variant)) = best else {
            debug!(label = %worst.label, "salvage returned no usable candidates");
            let similarity = self.gate.max_similarity_against(&worst, &good);
            return Ok(Salvage {
                variant: worst,
                similarity,
                cleared: false,
                candidates: 0,
            });
        };

        variant.label = worst.label.clone();
        let cleared = similarity <= threshold;
        if !cleared {
            info!(
                label = %variant.label,
                similarity,
                threshold,
                candidates = count,
                "salvage kept best candidate, still failing"
            );
        }
        Ok(Salvage {
            variant,
            similarity,
            cleared,
            candidates: count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraints_capture_openings_and_shapes() {
        let good = vec![
            Variant::new("A", "The moon, pale and slow, climbs."),
            Variant::new("C", "Silver light pours down?"),
        ];
        let c = ContrastiveConstraints::from_good(&good, 0.7);
        assert_eq!(c.forbidden_openings, vec!["the moon", "silver light"]);
        assert!(c.forbidden_patterns.contains(&"clauses=3;end=.".to_string()));
        assert!(c.forbidden_patterns.contains(&"clauses=1;end=?".to_string()));
        assert!(c.violates_opening("the moon again"));
        assert!(!c.violates_opening("a moon again"));
    }

    #[test]
    fn signature_without_punctuation() {
        assert_eq!(structural_signature("quiet water"), "clauses=1;end=none");
    }
}
