//! Test support: a deterministic embedder that needs no model.

use crate::embed::Embedder;
use crate::error::Result;

/// Produce a unit-norm vector pointing at `angle` radians in the plane of
/// the first two dimensions. Handy for placing test entries at controlled
/// cosine distances.
pub fn embedding_at_angle(angle: f64, dim: usize) -> Vec<f32> {
    let mut emb = vec![0.0; dim];
    if dim >= 2 {
        emb[0] = angle.cos() as f32;
        emb[1] = angle.sin() as f32;
    } else if dim == 1 {
        emb[0] = 1.0;
    }
    emb
}

/// Deterministic mock embedder: the text's bytes pick an angle, so equal
/// texts always embed identically and distinct texts usually diverge.
pub struct MockEmbedder {
    dim: usize,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(8)
    }
}

impl Embedder for MockEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut hash = 0u64;
        for b in text.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(b as u64);
        }
        let angle = (hash % 628) as f64 / 100.0;
        Ok(embedding_at_angle(angle, self.dim))
    }
}
