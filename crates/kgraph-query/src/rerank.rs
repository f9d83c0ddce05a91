//! Second-pass rescoring of a candidate set.
//!
//! Reranking replaces the upstream ordering entirely. The engine fetches
//! `limit × candidate_multiplier` candidates first, so top-K membership can
//! change. Cost ranges from roughly 1× (structural) to 16× (hybrid with
//! embedding) the upstream latency.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use kgraph_core::embedding::tokenize;
use kgraph_core::{cosine_similarity, KgError, Result};

use crate::request::{sort_hits, SearchHit};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankStrategy {
    /// BM25 over entity type and property text.
    Text,
    /// Cosine against the query embedding.
    Semantic,
    /// Log-scaled degree centrality.
    Structural,
    /// Weighted blend of the three.
    Hybrid,
}

impl RerankStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Semantic => "semantic",
            Self::Structural => "structural",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Blend weights for [`RerankStrategy::Hybrid`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankWeights {
    pub text: f32,
    pub semantic: f32,
    pub structural: f32,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self {
            text: 0.3,
            semantic: 0.5,
            structural: 0.2,
        }
    }
}

fn default_multiplier() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankOptions {
    pub strategy: RerankStrategy,
    /// Upstream fetches `limit × candidate_multiplier` candidates.
    #[serde(default = "default_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default)]
    pub weights: RerankWeights,
    /// Query text for text/semantic signals when the strategy carries none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl RerankOptions {
    #[must_use]
    pub fn new(strategy: RerankStrategy) -> Self {
        Self {
            strategy,
            candidate_multiplier: default_multiplier(),
            weights: RerankWeights::default(),
            text: None,
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// How many candidates to fetch for a final `limit`.
    #[must_use]
    pub fn candidates_for(&self, limit: usize) -> usize {
        limit.saturating_mul(self.candidate_multiplier.max(1))
    }

    /// # Errors
    ///
    /// Returns [`KgError::Validation`] for negative or all-zero hybrid weights.
    pub fn validate(&self) -> Result<()> {
        let w = self.weights;
        if self.strategy == RerankStrategy::Hybrid
            && (w.text < 0.0 || w.semantic < 0.0 || w.structural < 0.0 || w.text + w.semantic + w.structural <= 0.0)
        {
            return Err(KgError::validation("rerank.weights", "weights must be non-negative and not all zero"));
        }
        Ok(())
    }

    #[must_use]
    pub fn needs_degrees(&self) -> bool {
        matches!(self.strategy, RerankStrategy::Structural | RerankStrategy::Hybrid)
    }
}

/// Query-side inputs a reranker may need.
#[derive(Debug, Default)]
pub struct RerankInput<'a> {
    pub text: Option<&'a str>,
    pub embedding: Option<&'a [f32]>,
    /// Relation count per candidate id.
    pub degrees: Option<&'a HashMap<String, usize>>,
}

/// Rescore `hits` and reorder them by the new score.
///
/// # Errors
///
/// Returns [`KgError::Validation`] when a signal the strategy depends on is
/// unavailable (no query text for `text`, no query vector for `semantic`).
pub fn rerank(mut hits: Vec<SearchHit>, options: &RerankOptions, input: &RerankInput<'_>) -> Result<Vec<SearchHit>> {
    if hits.is_empty() {
        return Ok(hits);
    }
    let scores: Vec<f32> = match options.strategy {
        RerankStrategy::Text => {
            let text = input
                .text
                .ok_or_else(|| KgError::validation("rerank.text", "text reranking needs query text"))?;
            bm25_scores(&hits, text).into_iter().map(|s| s as f32).collect()
        }
        RerankStrategy::Semantic => {
            let embedding = input
                .embedding
                .ok_or_else(|| KgError::validation("rerank.text", "semantic reranking needs a query vector or text"))?;
            semantic_scores(&hits, embedding)
        }
        RerankStrategy::Structural => structural_scores(&hits, input.degrees),
        RerankStrategy::Hybrid => {
            let w = options.weights;
            let total = w.text + w.semantic + w.structural;
            let text = match input.text {
                Some(t) => min_max(&bm25_scores(&hits, t).into_iter().map(|s| s as f32).collect::<Vec<_>>()),
                None => vec![0.0; hits.len()],
            };
            let semantic = match input.embedding {
                Some(e) => min_max(&semantic_scores(&hits, e)),
                None => vec![0.0; hits.len()],
            };
            let structural = min_max(&structural_scores(&hits, input.degrees));
            (0..hits.len())
                .map(|i| (w.text * text[i] + w.semantic * semantic[i] + w.structural * structural[i]) / total)
                .collect()
        }
    };
    for (hit, score) in hits.iter_mut().zip(scores) {
        hit.score = score;
    }
    sort_hits(&mut hits);
    Ok(hits)
}

/// Okapi BM25 with the candidate set as corpus.
fn bm25_scores(hits: &[SearchHit], query: &str) -> Vec<f64> {
    let terms: HashSet<String> = tokenize(query).collect();
    let docs: Vec<Vec<String>> = hits
        .iter()
        .map(|h| tokenize(&h.entity.searchable_text()).collect())
        .collect();
    let n = docs.len() as f64;
    let avg_len = docs.iter().map(Vec::len).sum::<usize>() as f64 / n;

    let mut doc_freq: HashMap<&str, usize> = HashMap::new();
    for doc in &docs {
        let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
        for term in unique {
            if terms.contains(term) {
                *doc_freq.entry(term).or_default() += 1;
            }
        }
    }

    docs.iter()
        .map(|doc| {
            let len = doc.len() as f64;
            let mut tf: HashMap<&str, usize> = HashMap::new();
            for token in doc {
                if terms.contains(token) {
                    *tf.entry(token.as_str()).or_default() += 1;
                }
            }
            tf.iter()
                .map(|(term, &f)| {
                    let df = doc_freq.get(term).copied().unwrap_or(0) as f64;
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let f = f as f64;
                    let norm = if avg_len > 0.0 { len / avg_len } else { 1.0 };
                    idf * (f * (BM25_K1 + 1.0)) / (f + BM25_K1 * (1.0 - BM25_B + BM25_B * norm))
                })
                .sum()
        })
        .collect()
}

fn semantic_scores(hits: &[SearchHit], query: &[f32]) -> Vec<f32> {
    hits.iter()
        .map(|h| h.entity.embedding.as_deref().map_or(0.0, |e| cosine_similarity(query, e)))
        .collect()
}

fn structural_scores(hits: &[SearchHit], degrees: Option<&HashMap<String, usize>>) -> Vec<f32> {
    hits.iter()
        .map(|h| {
            let degree = degrees.and_then(|d| d.get(&h.entity.id)).copied().unwrap_or(0);
            (degree as f32).ln_1p()
        })
        .collect()
}

/// Scale into `[0, 1]`; a constant signal becomes all zeros.
fn min_max(values: &[f32]) -> Vec<f32> {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let span = max - min;
    if !(span > f32::EPSILON) {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - min) / span).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgraph_core::{Entity, ErrorKind};

    fn hit(id: &str, name: &str, embedding: Vec<f32>, score: f32) -> SearchHit {
        SearchHit::new(
            Entity::new(id, "Doc").with_property("name", name).with_embedding(embedding),
            score,
            None,
        )
    }

    fn hits() -> Vec<SearchHit> {
        vec![
            hit("a", "graph databases", vec![1.0, 0.0], 0.9),
            hit("b", "rust async runtime", vec![0.0, 1.0], 0.8),
            hit("c", "rust graph engine in rust", vec![0.7, 0.7], 0.1),
        ]
    }

    fn ids(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|h| h.entity.id.as_str()).collect()
    }

    #[test]
    fn text_rerank_prefers_term_matches() {
        let ranked = rerank(
            hits(),
            &RerankOptions::new(RerankStrategy::Text),
            &RerankInput {
                text: Some("rust"),
                ..RerankInput::default()
            },
        )
        .unwrap();
        assert_eq!(ids(&ranked), vec!["c", "b", "a"]);
        assert!((ranked[2].score).abs() < f32::EPSILON);
    }

    #[test]
    fn semantic_rerank_ignores_upstream_score() {
        let ranked = rerank(
            hits(),
            &RerankOptions::new(RerankStrategy::Semantic),
            &RerankInput {
                embedding: Some(&[0.0, 1.0]),
                ..RerankInput::default()
            },
        )
        .unwrap();
        assert_eq!(ranked[0].entity.id, "b");
    }

    #[test]
    fn structural_rerank_uses_degree() {
        let degrees = HashMap::from([("a".to_string(), 1), ("b".to_string(), 10)]);
        let ranked = rerank(
            hits(),
            &RerankOptions::new(RerankStrategy::Structural),
            &RerankInput {
                degrees: Some(&degrees),
                ..RerankInput::default()
            },
        )
        .unwrap();
        assert_eq!(ids(&ranked), vec!["b", "a", "c"]);
    }

    #[test]
    fn hybrid_blends_normalized_signals() {
        let degrees = HashMap::from([("c".to_string(), 5)]);
        let ranked = rerank(
            hits(),
            &RerankOptions::new(RerankStrategy::Hybrid),
            &RerankInput {
                text: Some("graph"),
                embedding: Some(&[1.0, 0.0]),
                degrees: Some(&degrees),
            },
        )
        .unwrap();
        assert!(ranked.iter().all(|h| (0.0..=1.0).contains(&h.score)));
        assert_eq!(ranked.last().map(|h| h.entity.id.as_str()), Some("b"));
    }

    #[test]
    fn missing_signal_is_validation_error() {
        let err = rerank(hits(), &RerankOptions::new(RerankStrategy::Text), &RerankInput::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn unknown_strategy_rejected_at_parse() {
        let parsed: std::result::Result<RerankOptions, _> =
            serde_json::from_value(serde_json::json!({"strategy": "vibes"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn candidate_count_scales_with_multiplier() {
        assert_eq!(RerankOptions::new(RerankStrategy::Text).candidates_for(10), 30);
    }
}
