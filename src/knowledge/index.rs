//! Per-project vector collection: `projects/<id>/knowledge.db`.
//!
//! Every read and write goes through a [`ProjectIndex`] bound to exactly one
//! project id. There is no cross-project handle and no shared collection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::{self, DbKind};
use crate::embedding::{embedding_to_bytes, EmbeddingIdentity};
use crate::error::{CanonError, Result};
use crate::segment::SegmentKind;

/// A segment ready to be written, id already derived.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: SegmentKind,
    pub text_hash: String,
    pub text: String,
}

/// A stored segment as returned by search.
#[derive(Debug, Clone, Serialize)]
pub struct StoredSegment {
    pub id: String,
    pub project_id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: SegmentKind,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub files: usize,
    pub segments: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content address of a segment: sha256(path ‖ sha256(text) ‖ ordinal).
///
/// `ordinal` separates identical texts within one file, so unchanged text
/// keeps its id even when the lines around it move.
pub fn segment_id(file_path: &str, text_hash: &str, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(text_hash.as_bytes());
    hasher.update([0u8]);
    hasher.update(ordinal.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct ProjectIndex {
    project_id: String,
    conn: Mutex<Connection>,
    /// Held for the duration of an ingest run. One writer per project.
    writer: Mutex<()>,
}

impl ProjectIndex {
    pub fn open(
        project_id: &str,
        path: impl AsRef<Path>,
        identity: &EmbeddingIdentity,
    ) -> Result<Self> {
        let conn = db::open_index_database(path, DbKind::Knowledge, identity)?;
        Ok(Self::from_connection(project_id, conn))
    }

    pub fn open_in_memory(project_id: &str, identity: &EmbeddingIdentity) -> Result<Self> {
        let conn = db::open_memory_database(DbKind::Knowledge, identity)?;
        Ok(Self::from_connection(project_id, conn))
    }

    fn from_connection(project_id: &str, conn: Connection) -> Self {
        Self {
            project_id: project_id.to_string(),
            conn: Mutex::new(conn),
            writer: Mutex::new(()),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CanonError::internal(format!("index lock poisoned: {e}")))
    }

    pub(crate) fn writer(&self) -> Result<MutexGuard<'_, ()>> {
        self.writer
            .lock()
            .map_err(|e| CanonError::internal(format!("writer lock poisoned: {e}")))
    }

    pub fn file_hash(&self, path: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT content_hash FROM files WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Ids of every segment currently stored for `path`.
    pub fn segment_ids_for_file(&self, path: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM segments WHERE file_path = ?1")?;
        let ids = stmt
            .query_map(params![path], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn indexed_files(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT path FROM files ORDER BY path")?;
        let paths = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(paths)
    }

    /// Insert a batch of new segments with their vectors in one transaction.
    pub fn insert_batch(&self, batch: &[(SegmentRecord, Vec<f32>)]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();
        for (record, embedding) in batch {
            insert_segment(&tx, &self.project_id, record, embedding, &now)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Close out one file: refresh line ranges of reused segments, drop stale
    /// ones and record the content hash. The hash is written last so an
    /// interrupted file is picked up again by the next run.
    pub fn finalize_file(
        &self,
        path: &str,
        content_hash: &str,
        size_bytes: u64,
        reused: &[SegmentRecord],
        stale_ids: &[String],
        segment_count: usize,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();

        for record in reused {
            tx.execute(
                "UPDATE segments SET start_line = ?1, end_line = ?2, updated_at = ?3 WHERE id = ?4",
                params![record.start_line as i64, record.end_line as i64, now, record.id],
            )?;
        }
        for id in stale_ids {
            delete_segment(&tx, id)?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO files (path, content_hash, size_bytes, segment_count, indexed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![path, content_hash, size_bytes as i64, segment_count as i64, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Delete the given segments. Returns how many were removed.
    pub fn remove_segments(&self, ids: &[String]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for id in ids {
            delete_segment(&tx, id)?;
        }
        tx.commit()?;
        Ok(ids.len())
    }

    /// Remove a file and all its segments. Returns the number of segments removed.
    pub fn remove_file(&self, path: &str) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM segments WHERE file_path = ?1")?;
            let ids = stmt
                .query_map(params![path], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };
        for id in &ids {
            delete_segment(&tx, id)?;
        }
        tx.execute("DELETE FROM files WHERE path = ?1", params![path])?;
        tx.commit()?;
        Ok(ids.len())
    }

    /// Nearest neighbours of `embedding` in this project's collection.
    ///
    /// Returns segments paired with their sqlite-vec L2 distance, nearest first.
    pub fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<(StoredSegment, f64)>> {
        let conn = self.lock()?;
        let hits = vector_search(&conn, embedding, k)?;
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        let mut rows = fetch_segments(&conn, &ids)?;

        let mut results = Vec::with_capacity(hits.len());
        for (id, distance) in hits {
            if let Some(segment) = rows.remove(&id) {
                results.push((segment, distance));
            }
        }
        Ok(results)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let conn = self.lock()?;
        let files: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
        let segments: i64 = conn.query_row("SELECT COUNT(*) FROM segments", [], |r| r.get(0))?;
        Ok(IndexStats {
            files: files as usize,
            segments: segments as usize,
        })
    }
}

fn insert_segment(
    tx: &Transaction,
    project_id: &str,
    record: &SegmentRecord,
    embedding: &[f32],
    now: &str,
) -> Result<()> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO segments \
         (id, project_id, file_path, start_line, end_line, kind, text_hash, text, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            record.id,
            project_id,
            record.file_path,
            record.start_line as i64,
            record.end_line as i64,
            record.kind.as_str(),
            record.text_hash,
            record.text,
            now,
        ],
    )?;
    // Already present from an interrupted run: the vector is there too.
    if inserted == 0 {
        return Ok(());
    }
    tx.execute(
        "INSERT INTO segments_vec (id, embedding) VALUES (?1, ?2)",
        params![record.id, embedding_to_bytes(embedding)],
    )?;
    Ok(())
}

fn delete_segment(tx: &Transaction, id: &str) -> Result<()> {
    tx.execute("DELETE FROM segments_vec WHERE id = ?1", params![id])?;
    tx.execute("DELETE FROM segments WHERE id = ?1", params![id])?;
    Ok(())
}

/// Vector KNN search via sqlite-vec.
fn vector_search(conn: &Connection, embedding: &[f32], limit: usize) -> Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM segments_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let results = stmt
        .query_map(params![embedding_to_bytes(embedding), limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(results)
}

fn fetch_segments(conn: &Connection, ids: &[&str]) -> Result<HashMap<String, StoredSegment>> {
    let mut out = HashMap::with_capacity(ids.len());
    let mut stmt = conn.prepare(
        "SELECT id, project_id, file_path, start_line, end_line, kind, text FROM segments WHERE id = ?1",
    )?;
    for id in ids {
        let row = stmt
            .query_row(params![id], |row| {
                let kind: String = row.get(5)?;
                Ok(StoredSegment {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    file_path: row.get(2)?,
                    start_line: row.get::<_, i64>(3)? as usize,
                    end_line: row.get::<_, i64>(4)? as usize,
                    kind: SegmentKind::parse(&kind).unwrap_or(SegmentKind::Code),
                    text: row.get(6)?,
                })
            })
            .optional()?;
        if let Some(segment) = row {
            out.insert(segment.id.clone(), segment);
        }
    }
    Ok(out)
}
