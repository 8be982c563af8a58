//! Text-to-vector embedding pipeline.
//!
//! Provides the [`EmbeddingProvider`] capability trait, the retrying
//! [`EmbeddingGateway`] every caller goes through, and the built-in
//! [`hashing::HashingEmbeddingProvider`]. The provider is created via
//! [`create_provider`] from configuration.

pub mod hashing;

use std::sync::Arc;

use serde::Serialize;

use crate::error::{CanonError, ProviderError, Result};
use crate::retry::RetryPolicy;

/// Default number of dimensions for the built-in provider.
pub const EMBEDDING_DIM: usize = 384;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`dimensions`](Self::dimensions)
/// entries. All methods are synchronous — callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError>;

    /// Embed a batch of text strings. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Return the number of dimensions this provider produces.
    fn dimensions(&self) -> usize;

    /// Stable identifier recorded in every index built with this provider.
    fn model_name(&self) -> &str;
}

/// The (model, dimensions) pair an index database is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddingIdentity {
    pub model: String,
    pub dimensions: usize,
}

/// Retrying front door to an [`EmbeddingProvider`].
///
/// Transient provider failures are retried per [`RetryPolicy`]; vectors of the
/// wrong length are rejected as permanent failures.
#[derive(Clone)]
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
}

impl EmbeddingGateway {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    pub fn identity(&self) -> EmbeddingIdentity {
        EmbeddingIdentity {
            model: self.provider.model_name().to_string(),
            dimensions: self.provider.dimensions(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let dims = self.provider.dimensions();
        self.retry.run("embedding", || {
            let v = self.provider.embed(text)?;
            check_len(&v, dims)?;
            Ok(v)
        })
    }

    pub fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let dims = self.provider.dimensions();
        self.retry.run("embedding", || {
            let vectors = self.provider.embed_batch(texts)?;
            if vectors.len() != texts.len() {
                return Err(ProviderError::Permanent(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    texts.len()
                )));
            }
            for v in &vectors {
                check_len(v, dims)?;
            }
            Ok(vectors)
        })
    }
}

fn check_len(v: &[f32], dims: usize) -> std::result::Result<(), ProviderError> {
    if v.len() != dims {
        return Err(ProviderError::Permanent(format!(
            "expected {dims}-dimensional vector, got {}",
            v.len()
        )));
    }
    Ok(())
}

/// Create an embedding provider from config.
///
/// Currently only `"hashing"` ships with the crate. Other providers are
/// plugged in through [`EmbeddingProvider`] directly.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(hashing::HashingEmbeddingProvider::new(
            &config.model,
            config.dimensions,
        ))),
        other => Err(CanonError::validation(format!(
            "unknown embedding provider: {other}. Supported: hashing"
        ))),
    }
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Inverse of [`embedding_to_bytes`].
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Cosine similarity of two equal-length vectors. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        na += f64::from(*x) * f64::from(*x);
        nb += f64::from(*y) * f64::from(*y);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// sqlite-vec reports L2 distance; for unit vectors cos = 1 - d²/2.
/// Clamped to [0, 1] so opposite vectors read as unrelated rather than negative.
pub fn l2_distance_to_cosine(distance: f64) -> f64 {
    (1.0 - distance * distance / 2.0).clamp(0.0, 1.0)
}
