//! Optional prompt → text capability used for answer synthesis.
//!
//! No concrete model ships with the crate; callers plug one in through
//! [`LanguageModel`]. Calls go through the same [`RetryPolicy`](crate::retry::RetryPolicy)
//! as embeddings.

use crate::error::ProviderError;
use crate::knowledge::query::SegmentHit;

pub trait LanguageModel: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, ProviderError>;

    fn model_name(&self) -> &str {
        "unknown"
    }
}

/// Prompt that restricts the answer to the retrieved segments.
///
/// Segments are added in rank order until `max_context_chars` would be exceeded;
/// the first segment is always included.
pub fn build_grounded_prompt(question: &str, hits: &[SegmentHit], max_context_chars: usize) -> String {
    let mut context = String::new();
    for (i, hit) in hits.iter().enumerate() {
        let block = format!(
            "[{n}] {path}:{start}-{end} ({kind})\n{text}\n\n",
            n = i + 1,
            path = hit.file_path,
            start = hit.start_line,
            end = hit.end_line,
            kind = hit.kind,
            text = hit.text,
        );
        if i > 0 && context.len() + block.len() > max_context_chars {
            break;
        }
        context.push_str(&block);
    }

    format!(
        "Answer the question using only the numbered excerpts below. \
         Cite excerpts by number. If the excerpts do not contain the answer, say so.\n\n\
         {context}Question: {question}\nAnswer:"
    )
}
