//! Mutual distinctness of sibling variants.
//!
//! Similarity is token-set Jaccard, optionally maxed with bigram-set
//! Jaccard. A line passes when no pair exceeds the mode's threshold.

use std::collections::HashSet;

use crate::config::engine::DiversityConfig;
use crate::model::{Mode, Variant};

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct GateVerdict {
    pub pass: bool,
    pub max_similarity: f64,
    pub threshold: f64,
    /// Variant most similar to at least one sibling. Set only on failure.
    pub worst_index: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct DiversityGate {
    config: DiversityConfig,
}

impl DiversityGate {
    pub fn new(config: DiversityConfig) -> Self {
        Self { config }
    }

    /// Allowed similarity for a mode. Short lines get extra leniency since
    /// a shared word or two already moves the ratio a lot.
    pub fn threshold(&self, mode: Mode, line_tokens: usize) -> f64 {
        let base = self.config.thresholds.get(mode);
        let lenient = if line_tokens < self.config.short_line_tokens {
            self.config.short_line_leniency
        } else {
            0.0
        };
        (base + lenient).min(1.0)
    }

    pub fn similarity(&self, a: &Variant, b: &Variant) -> f64 {
        let ta = tokenize(&a.text);
        let tb = tokenize(&b.text);

        let mut score = jaccard(&ta.iter().cloned().collect(), &tb.iter().cloned().collect());
        if self.config.bigram_check {
            score = score.max(jaccard(&bigrams(&ta), &bigrams(&tb)));
        }
        if same_approach(a, b) {
            score += self.config.approach_collision_penalty;
        }
        score.min(1.0)
    }

    /// Highest similarity between `candidate` and any of `anchors`.
    pub fn max_similarity_against(&self, candidate: &Variant, anchors: &[Variant]) -> f64 {
        anchors
            .iter()
            .map(|a| self.similarity(candidate, a))
            .fold(0.0, f64::max)
    }

    pub fn evaluate(&self, variants: &[Variant], mode: Mode, line_tokens: usize) -> GateVerdict {
        let threshold = self.threshold(mode, line_tokens);
        let n = variants.len();
        if n < 2 {
            return GateVerdict {
                pass: true,
                max_similarity: 0.0,
                threshold,
                worst_index: None,
            };
        }

        let mut peak = vec![0.0_f64; n];
        let mut total = vec![0.0_f64; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let s = self.similarity(&variants[i], &variants[j]);
                peak[i] = peak[i].max(s);
                peak[j] = peak[j].max(s);
                total[i] += s;
                total[j] += s;
            }
        }

        let max_similarity = peak.iter().copied().fold(0.0, f64::max);
        let pass = max_similarity <= threshold + EPSILON;

        // Among the variants sharing the top pair score, the one closest to
        // all siblings overall goes; later slots lose exact ties.
        let worst_index = if pass {
            None
        } else {
            (0..n)
                .filter(|&i| (peak[i] - max_similarity).abs() < EPSILON)
                .max_by(|&a, &b| {
                    total[a]
                        .partial_cmp(&total[b])
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.cmp(&b))
                })
        };

        GateVerdict {
            pass,
            max_similarity,
            threshold,
            worst_index,
        }
    }
}

/// Lowercased word tokens. Apostrophes stay inside words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|t| t.trim_matches('\'').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(b).count();
    let union = a.union(b).count();
    shared as f64 / union as f64
}

fn bigrams(tokens: &[String]) -> HashSet<String> {
    tokens.windows(2).map(|w| format!("{} {}", w[0], w[1])).collect()
}

fn same_approach(a: &Variant, b: &Variant) -> bool {
    let approach = |v: &Variant| {
        v.self_report
            .as_ref()
            .and_then(|r| r.approach.as_deref())
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    };
    match (approach(a), approach(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> DiversityGate {
        DiversityGate::new(DiversityConfig::default())
    }

    fn variants(texts: &[&str]) -> Vec<Variant> {
        let labels = ["A", "B", "C", "D"];
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Variant::new(labels[i], *t))
            .collect()
    }

    #[test]
    fn identical_variants_fail_and_point_at_a_duplicate() {
        let v = variants(&[
            "the river keeps its silver secrets",
            "the river keeps its silver secrets",
            "the river keeps its silver secrets",
        ]);
        let verdict = gate().evaluate(&v, Mode::Balanced, 6);
        assert!(!verdict.pass);
        assert_eq!(verdict.max_similarity, 1.0);
        assert!(verdict.worst_index.is_some_and(|i| i < 3));
    }

    #[test]
    fn near_duplicate_pair_is_flagged() {
        // {A,B} = 0.9, {A,C} = 0.2, {B,C} ~ 0.18
        let v = variants(&[
            "the moon rose over silent water and cold stone",
            "the moon rose over silent water and cold stone tonight",
            "the moon wept",
        ]);
        let g = gate();
        assert!((g.similarity(&v[0], &v[1]) - 0.9).abs() < 1e-9);
        assert!((g.similarity(&v[0], &v[2]) - 0.2).abs() < 1e-9);

        let verdict = g.evaluate(&v, Mode::Balanced, 9);
        assert!(!verdict.pass);
        assert!(matches!(verdict.worst_index, Some(0) | Some(1)));
    }

    #[test]
    fn distinct_variants_pass() {
        let v = variants(&[
            "night pours ink across the fields",
            "darkness spills over every meadow",
            "a black tide floods the farmland",
        ]);
        let verdict = gate().evaluate(&v, Mode::Balanced, 6);
        assert!(verdict.pass);
        assert_eq!(verdict.worst_index, None);
    }

    #[test]
    fn short_lines_get_a_more_lenient_threshold() {
        let g = gate();
        assert!(g.threshold(Mode::Balanced, 3) > g.threshold(Mode::Balanced, 12));
        assert!(g.threshold(Mode::Conservative, 3) <= 1.0);
    }

    #[test]
    fn shared_declared_approach_adds_penalty() {
        let g = gate();
        let a = Variant::new("A", "night pours ink").with_approach("literal");
        let b = Variant::new("B", "darkness spills over").with_approach("Literal");
        let c = Variant::new("C", "darkness spills over").with_approach("sonic");
        let plain = g.similarity(&a, &c);
        assert!((g.similarity(&a, &b) - (plain + 0.10)).abs() < 1e-9);
    }

    #[test]
    fn bigram_check_never_lowers_similarity() {
        let mut config = DiversityConfig::default();
        config.bigram_check = true;
        let with_bigrams = DiversityGate::new(config);
        let tokens_only = gate();

        let a = Variant::new("A", "over the hills and far away");
        let b = Variant::new("B", "far away over the hills");
        assert!(with_bigrams.similarity(&a, &b) >= tokens_only.similarity(&a, &b));
        assert_eq!(with_bigrams.similarity(&a, &a), 1.0);
    }

    #[test]
    fn tokenize_lowercases_and_keeps_contractions() {
        assert_eq!(
            tokenize("Don't  weep, O Moon!"),
            vec!["don't", "weep", "o", "moon"]
        );
    }
}
