//! Read path: validated, single-project similarity search.

use serde::{Deserialize, Serialize};

use super::index::ProjectIndex;
use crate::embedding::l2_distance_to_cosine;
use crate::error::{CanonError, Result};
use crate::segment::SegmentKind;

/// A question scoped to one project. `project_id` is required at run time;
/// it is optional here only so a missing value can be rejected explicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub project_id: Option<String>,
    pub question: String,
    /// Falls back to `retrieval.default_k`; capped at `retrieval.max_k`.
    pub k: Option<usize>,
    #[serde(default)]
    pub synthesize: bool,
}

impl QueryRequest {
    pub fn new(project_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            question: question.into(),
            k: None,
            synthesize: false,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_synthesis(mut self) -> Self {
        self.synthesize = true;
        self
    }

    /// Check the request shape. Returns the trimmed project id and the effective k.
    pub(crate) fn validate(&self, default_k: usize, max_k: usize) -> Result<(String, usize)> {
        let project_id = match self.project_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                return Err(CanonError::validation(
                    "project_id is required; queries never span projects",
                ))
            }
        };
        if self.question.trim().is_empty() {
            return Err(CanonError::validation("question must not be empty"));
        }
        let k = match self.k {
            Some(0) => return Err(CanonError::validation("k must be at least 1")),
            Some(k) => k.min(max_k),
            None => default_k.min(max_k),
        };
        Ok((project_id, k))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentHit {
    pub segment_id: String,
    pub project_id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: SegmentKind,
    pub text: String,
    /// Cosine similarity in [0, 1].
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub project_id: String,
    pub question: String,
    pub results: Vec<SegmentHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis_error: Option<String>,
}

/// kNN over one project's collection, with a guard that drops any row not
/// owned by that project.
pub fn search_project(index: &ProjectIndex, embedding: &[f32], k: usize) -> Result<Vec<SegmentHit>> {
    let project_id = index.project_id();
    let mut hits = Vec::with_capacity(k);
    for (segment, distance) in index.search(embedding, k)? {
        if segment.project_id != project_id {
            tracing::error!(
                requested = %project_id,
                found = %segment.project_id,
                segment_id = %segment.id,
                "foreign segment in project index, dropped"
            );
            continue;
        }
        hits.push(SegmentHit {
            segment_id: segment.id,
            project_id: segment.project_id,
            file_path: segment.file_path,
            start_line: segment.start_line,
            end_line: segment.end_line,
            kind: segment.kind,
            text: segment.text,
            score: l2_distance_to_cosine(distance),
        });
    }
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
    Ok(hits)
}
