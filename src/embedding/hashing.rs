//! Deterministic lexical embedding provider.
//!
//! Signed feature hashing over lower-cased word tokens, identifier sub-words
//! (`camelCase` / `snake_case` pieces) and 5-character prefixes, followed by
//! L2 normalization. No model files, no network: the same text always maps to
//! the same vector, which makes it the default provider and the test fixture.

use sha2::{Digest, Sha256};

use super::{l2_normalize, EmbeddingProvider};
use crate::error::ProviderError;

const PREFIX_LEN: usize = 5;

const WORD_WEIGHT: f32 = 1.0;
const SUBWORD_WEIGHT: f32 = 0.6;
const PREFIX_WEIGHT: f32 = 0.5;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "does", "do", "for", "from", "how", "in",
    "is", "it", "of", "on", "or", "the", "this", "that", "to", "was", "what", "when", "where",
    "which", "who", "why", "with", "work", "works",
];

pub struct HashingEmbeddingProvider {
    model: String,
    dimensions: usize,
}

impl HashingEmbeddingProvider {
    pub fn new(model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            model: model.into(),
            dimensions: dimensions.max(1),
        }
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

impl EmbeddingProvider for HashingEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut v = vec![0.0f32; self.dimensions];

        for raw in raw_tokens(text) {
            let subwords = split_identifier(raw);
            let word = raw.to_lowercase();

            if !STOPWORDS.contains(&word.as_str()) {
                self.add_feature(&mut v, &format!("w:{word}"), WORD_WEIGHT);
                if word.chars().count() > PREFIX_LEN {
                    let prefix: String = word.chars().take(PREFIX_LEN).collect();
                    self.add_feature(&mut v, &format!("p:{prefix}"), PREFIX_WEIGHT);
                }
            }

            if subwords.len() > 1 {
                for sub in subwords {
                    if sub.chars().count() < 2 || STOPWORDS.contains(&sub.as_str()) {
                        continue;
                    }
                    self.add_feature(&mut v, &format!("w:{sub}"), SUBWORD_WEIGHT);
                    if sub.chars().count() > PREFIX_LEN {
                        let prefix: String = sub.chars().take(PREFIX_LEN).collect();
                        self.add_feature(&mut v, &format!("p:{prefix}"), PREFIX_WEIGHT);
                    }
                }
            }
        }

        l2_normalize(&mut v);
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Alphanumeric runs, keeping `_` so identifiers stay whole.
fn raw_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
}

/// Split `parseHttpHeader` / `parse_http_header` into lower-cased pieces.
fn split_identifier(token: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for piece in token.split('_').filter(|p| !p.is_empty()) {
        let mut current = String::new();
        let mut prev_lower = false;
        for c in piece.chars() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                parts.push(current.to_lowercase());
                current.clear();
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.push(c);
        }
        if !current.is_empty() {
            parts.push(current.to_lowercase());
        }
    }
    parts
}
