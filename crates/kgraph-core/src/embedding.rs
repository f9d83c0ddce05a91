//! Embedding provider seam and vector math.

use async_trait::async_trait;

use crate::error::{KgError, Result};

/// Turns query text into a vector. Injected by the caller; the engine never
/// talks to a model provider directly.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Length of the vectors this provider returns.
    fn dimension(&self) -> usize;
}

/// Deterministic bag-of-words embedder.
///
/// Each lowercase token is hashed (FNV-1a) into a bucket with a signed
/// contribution, and the result is L2-normalized. Texts sharing words end up
/// with positive cosine similarity. Useful for tests and offline use.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Synchronous variant of [`EmbeddingProvider::embed`].
    #[must_use]
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        for token in tokenize(text) {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(KgError::validation("text", "cannot embed empty text"));
        }
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Lowercased alphanumeric tokens.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Cosine similarity in `[-1, 1]`; 0.0 for mismatched lengths or zero vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Scale `v` to unit length in place. Zero vectors are left unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = [0.3, -0.2, 0.9];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_degenerate_input() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed_text("Rust systems programming");
        let b = embedder.embed_text("Rust systems programming");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_words_score_higher_than_disjoint_text() {
        let embedder = HashEmbedder::new(256);
        let query = embedder.embed_text("graph database");
        let close = embedder.embed_text("a graph database engine");
        let far = embedder.embed_text("cooking pasta recipes");
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    proptest::proptest! {
        #[test]
        fn cosine_is_bounded_and_symmetric(
            pairs in proptest::collection::vec((-100.0_f32..100.0, -100.0_f32..100.0), 1..32)
        ) {
            let (a, b): (Vec<f32>, Vec<f32>) = pairs.into_iter().unzip();
            let ab = cosine_similarity(&a, &b);
            proptest::prop_assert!((-1.0..=1.0).contains(&ab));
            proptest::prop_assert!((ab - cosine_similarity(&b, &a)).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn provider_rejects_blank_text() {
        let embedder = HashEmbedder::new(8);
        assert!(embedder.embed("   ").await.is_err());
        assert_eq!(embedder.embed("hello").await.unwrap().len(), 8);
    }
}
