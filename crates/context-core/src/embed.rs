//! Embedding provider capability.
//!
//! The core consumes embeddings but never synthesizes them: callers attach
//! vectors to store/push requests, and entries without embeddings simply
//! skip semantic dedup. Hosts implement this trait over whatever provider
//! they use; vectors are assumed unit-norm and of a fixed dimension for a
//! given store instance.

use crate::error::Result;

pub trait Embedder: Send + Sync {
    /// Embed a single text into a unit-norm vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts. The default delegates to `embed` per text;
    /// providers with real batch endpoints should override it.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}
