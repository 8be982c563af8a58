//! Write path: walk → filter → redact → segment → embed → upsert.
//!
//! Runs sequentially over one project's tree while holding that project's
//! writer lock. Unchanged files are skipped by whole-file hash, unchanged
//! segments by content address. New segments are embedded and committed in
//! batches; per-file failures are recorded and the walk continues.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::index::{segment_id, sha256_hex, ProjectIndex, SegmentRecord};
use crate::embedding::EmbeddingGateway;
use crate::error::{CanonError, Result};
use crate::filter::{CandidateFile, PathFilter, Redactor};
use crate::segment::{segment, SegmentOptions};

/// Everything the write path needs besides the target index.
#[derive(Clone)]
pub struct IngestPipeline {
    pub filter: PathFilter,
    pub redactor: Redactor,
    pub segment_options: SegmentOptions,
    pub gateway: EmbeddingGateway,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

/// Structured result of one ingest run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub project_id: String,
    pub files_scanned: usize,
    pub files_ingested: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub files_removed: usize,
    pub segments_written: usize,
    pub segments_reused: usize,
    pub segments_removed: usize,
    pub failures: Vec<FileFailure>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl IngestSummary {
    pub fn has_failures(&self) -> bool {
        self.files_failed > 0
    }

    fn fail(&mut self, path: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(project_id = %self.project_id, path = %path, reason = %reason, "file skipped");
        self.files_failed += 1;
        self.failures.push(FileFailure {
            path: path.to_string(),
            reason,
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestProgress {
    pub files_total: usize,
    pub files_done: usize,
    pub current_path: Option<String>,
}

enum FileOutcome {
    Skipped,
    Ingested {
        written: usize,
        reused: usize,
        removed: usize,
    },
    Cancelled,
}

/// Ingest `root` into `index`.
///
/// Returns an error only for problems with the run itself (bad root, storage
/// failure). Per-file problems land in [`IngestSummary::failures`].
pub fn run_ingest(
    pipeline: &IngestPipeline,
    index: &ProjectIndex,
    root: &Path,
    cancel: &CancellationToken,
    progress: &dyn Fn(&IngestProgress),
) -> Result<IngestSummary> {
    if !root.is_dir() {
        return Err(CanonError::validation(format!(
            "ingest root {} is not a directory",
            root.display()
        )));
    }

    let _writer = index.writer()?;
    let started = Instant::now();
    let mut summary = IngestSummary {
        project_id: index.project_id().to_string(),
        ..Default::default()
    };

    let walk = pipeline.filter.walk(root);
    summary.files_scanned = walk.files.len();
    for (path, reason) in &walk.errors {
        summary.fail(path, reason.clone());
    }

    tracing::info!(
        project_id = %summary.project_id,
        root = %root.display(),
        files = summary.files_scanned,
        "ingest started"
    );

    let total = walk.files.len();
    for (done, file) in walk.files.iter().enumerate() {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }
        progress(&IngestProgress {
            files_total: total,
            files_done: done,
            current_path: Some(file.relative.clone()),
        });

        match ingest_file(pipeline, index, file, cancel) {
            Ok(FileOutcome::Skipped) => summary.files_skipped += 1,
            Ok(FileOutcome::Ingested {
                written,
                reused,
                removed,
            }) => {
                summary.files_ingested += 1;
                summary.segments_written += written;
                summary.segments_reused += reused;
                summary.segments_removed += removed;
            }
            Ok(FileOutcome::Cancelled) => {
                summary.cancelled = true;
                break;
            }
            Err(e @ (CanonError::Storage(_) | CanonError::Internal(_))) => return Err(e),
            Err(e) => summary.fail(&file.relative, e.to_string()),
        }
    }

    // Pruning needs the full picture of what is on disk.
    if !summary.cancelled {
        let present: HashSet<&str> = walk.files.iter().map(|f| f.relative.as_str()).collect();
        for path in index.indexed_files()? {
            if !present.contains(path.as_str()) {
                summary.segments_removed += index.remove_file(&path)?;
                summary.files_removed += 1;
                tracing::debug!(path = %path, "removed deleted file from index");
            }
        }
    }

    progress(&IngestProgress {
        files_total: total,
        files_done: summary.files_ingested + summary.files_skipped + summary.files_failed,
        current_path: None,
    });

    summary.duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        project_id = %summary.project_id,
        ingested = summary.files_ingested,
        skipped = summary.files_skipped,
        failed = summary.files_failed,
        removed = summary.files_removed,
        segments_written = summary.segments_written,
        cancelled = summary.cancelled,
        duration_ms = summary.duration_ms,
        "ingest finished"
    );
    Ok(summary)
}

fn ingest_file(
    pipeline: &IngestPipeline,
    index: &ProjectIndex,
    file: &CandidateFile,
    cancel: &CancellationToken,
) -> Result<FileOutcome> {
    let bytes = std::fs::read(&file.absolute)?;
    let content_hash = sha256_hex(&bytes);
    if index.file_hash(&file.relative)?.as_deref() == Some(content_hash.as_str()) {
        return Ok(FileOutcome::Skipped);
    }

    let text = String::from_utf8(bytes)
        .map_err(|_| CanonError::validation("file is not valid UTF-8"))?;
    let redacted = pipeline.redactor.redact(&text);
    let candidates = segment(&redacted, file.kind, &pipeline.segment_options);

    // Derive content addresses; identical texts within a file get distinct ordinals.
    let mut ordinals: HashMap<String, usize> = HashMap::new();
    let records: Vec<SegmentRecord> = candidates
        .into_iter()
        .map(|c| {
            let text_hash = sha256_hex(c.text.as_bytes());
            let ordinal = ordinals.entry(text_hash.clone()).or_insert(0);
            let id = segment_id(&file.relative, &text_hash, *ordinal);
            *ordinal += 1;
            SegmentRecord {
                id,
                file_path: file.relative.clone(),
                start_line: c.start_line,
                end_line: c.end_line,
                kind: file.kind,
                text_hash,
                text: c.text,
            }
        })
        .collect();

    let existing: HashSet<String> = index.segment_ids_for_file(&file.relative)?.into_iter().collect();
    let wanted: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
    let stale: Vec<String> = existing
        .iter()
        .filter(|id| !wanted.contains(id.as_str()))
        .cloned()
        .collect();
    let (reused, fresh): (Vec<SegmentRecord>, Vec<SegmentRecord>) =
        records.into_iter().partition(|r| existing.contains(&r.id));

    // Segments committed for this file so far; withdrawn if the file does not finish.
    let mut inserted: Vec<String> = Vec::with_capacity(fresh.len());
    for batch in fresh.chunks(pipeline.batch_size.max(1)) {
        if cancel.is_cancelled() {
            discard_partial(index, &file.relative, &inserted)?;
            return Ok(FileOutcome::Cancelled);
        }
        let texts: Vec<&str> = batch.iter().map(|r| r.text.as_str()).collect();
        let vectors = match pipeline.gateway.embed_batch(&texts) {
            Ok(vectors) => vectors,
            Err(e) => {
                discard_partial(index, &file.relative, &inserted)?;
                return Err(e);
            }
        };
        let rows: Vec<(SegmentRecord, Vec<f32>)> = batch.iter().cloned().zip(vectors).collect();
        index.insert_batch(&rows)?;
        inserted.extend(batch.iter().map(|r| r.id.clone()));
    }

    index.finalize_file(
        &file.relative,
        &content_hash,
        file.size,
        &reused,
        &stale,
        reused.len() + fresh.len(),
    )?;

    Ok(FileOutcome::Ingested {
        written: fresh.len(),
        reused: reused.len(),
        removed: stale.len(),
    })
}

fn discard_partial(index: &ProjectIndex, path: &str, inserted: &[String]) -> Result<()> {
    if inserted.is_empty() {
        return Ok(());
    }
    let removed = index.remove_segments(inserted)?;
    tracing::debug!(path = %path, removed, "withdrew segments of unfinished file");
    Ok(())
}
