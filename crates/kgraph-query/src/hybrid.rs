//! Score fusion for hybrid search.

use kgraph_core::{KgError, Result};

/// Vector/graph weights normalized to sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridWeights {
    vector: f32,
    graph: f32,
}

impl HybridWeights {
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] for negative, non-finite or all-zero weights.
    pub fn normalized(vector: f32, graph: f32) -> Result<Self> {
        if !vector.is_finite() || !graph.is_finite() || vector < 0.0 || graph < 0.0 {
            return Err(KgError::validation("vector_weight", "weights must be finite and non-negative"));
        }
        let total = vector + graph;
        if total <= 0.0 {
            return Err(KgError::validation("vector_weight", "weights must not both be zero"));
        }
        Ok(Self {
            vector: vector / total,
            graph: graph / total,
        })
    }

    #[must_use]
    pub fn vector(&self) -> f32 {
        self.vector
    }

    #[must_use]
    pub fn graph(&self) -> f32 {
        self.graph
    }

    #[must_use]
    pub fn fuse(&self, vector_score: f32, graph_score: f32) -> f32 {
        self.vector * vector_score + self.graph * graph_score
    }
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self { vector: 0.6, graph: 0.4 }
    }
}

/// Graph proximity: 1 for a seed, decaying with hop count.
#[must_use]
pub fn graph_score(hops: u32) -> f32 {
    1.0 / (1.0 + hops as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn weights_are_normalized() {
        let w = HybridWeights::normalized(3.0, 1.0).unwrap();
        assert!((w.vector() - 0.75).abs() < 1e-6);
        assert!((w.graph() - 0.25).abs() < 1e-6);
        assert!(HybridWeights::normalized(0.0, 0.0).is_err());
        assert!(HybridWeights::normalized(-1.0, 2.0).is_err());
    }

    #[test]
    fn graph_score_decays_with_hops() {
        assert!((graph_score(0) - 1.0).abs() < f32::EPSILON);
        assert!((graph_score(1) - 0.5).abs() < f32::EPSILON);
        assert!(graph_score(3) < graph_score(2));
    }

    proptest! {
        #[test]
        fn score_non_decreasing_in_vector_weight(
            graph_score in 0.0f32..1.0,
            gap in 0.0001f32..1.0,
            w1 in 0.0f32..1.0,
            w2 in 0.0f32..1.0,
        ) {
            let vector_score = (graph_score + gap).min(1.0);
            prop_assume!(vector_score > graph_score);
            let (lo, hi) = if w1 <= w2 { (w1, w2) } else { (w2, w1) };
            let low = HybridWeights::normalized(lo, 1.0 - lo).unwrap();
            let high = HybridWeights::normalized(hi, 1.0 - hi).unwrap();
            let a = low.fuse(vector_score, graph_score);
            let b = high.fuse(vector_score, graph_score);
            prop_assert!(b + 1e-6 >= a, "w={lo}->{hi}: {a} > {b}");
        }

        #[test]
        fn fused_score_stays_between_inputs(
            v in 0.0f32..1.0,
            g in 0.0f32..1.0,
            w in 0.0f32..=1.0,
        ) {
            let weights = HybridWeights::normalized(w, 1.0 - w).unwrap();
            let s = weights.fuse(v, g);
            prop_assert!(s >= v.min(g) - 1e-6 && s <= v.max(g) + 1e-6);
        }
    }
}
