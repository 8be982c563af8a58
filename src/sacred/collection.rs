//! Storage primitives over one project's `sacred.db`.
//!
//! Free functions over a bare [`Connection`] or [`Transaction`]; callers in
//! [`super::SacredPlanStore`] decide transaction boundaries and locking.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::types::{PlanLogEntry, PlanSegment, PlanStatus, SacredPlan};
use crate::embedding::{bytes_to_embedding, embedding_to_bytes};
use crate::error::{CanonError, Result};
use crate::segment::SegmentCandidate;

const PLAN_COLUMNS: &str = "p.id, p.project_id, p.title, p.body, p.status, p.approver, p.approved_at, \
     p.locked_at, p.supersedes, p.superseded_by, p.created_at, p.updated_at, \
     (SELECT COUNT(*) FROM sacred_segments s WHERE s.plan_id = p.id)";

fn row_to_plan(row: &Row) -> rusqlite::Result<SacredPlan> {
    let status: String = row.get(4)?;
    let status = status.parse::<PlanStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(SacredPlan {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        status,
        approver: row.get(5)?,
        approved_at: row.get(6)?,
        locked_at: row.get(7)?,
        supersedes: row.get(8)?,
        superseded_by: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        segment_count: row.get::<_, i64>(12)? as usize,
    })
}

pub fn find_plan(conn: &Connection, plan_id: &str) -> Result<Option<SacredPlan>> {
    let sql = format!("SELECT {PLAN_COLUMNS} FROM sacred_plans p WHERE p.id = ?1");
    Ok(conn
        .query_row(&sql, params![plan_id], row_to_plan)
        .optional()?)
}

pub fn load_plan(conn: &Connection, plan_id: &str) -> Result<SacredPlan> {
    find_plan(conn, plan_id)?.ok_or_else(|| CanonError::not_found("sacred plan", plan_id))
}

pub fn list_plans(conn: &Connection, status: Option<PlanStatus>) -> Result<Vec<SacredPlan>> {
    let mut sql = format!("SELECT {PLAN_COLUMNS} FROM sacred_plans p");
    if status.is_some() {
        sql.push_str(" WHERE p.status = ?1");
    }
    sql.push_str(" ORDER BY p.created_at, p.id");
    let mut stmt = conn.prepare(&sql)?;
    let plans = match status {
        Some(s) => stmt.query_map(params![s.as_str()], row_to_plan)?,
        None => stmt.query_map([], row_to_plan)?,
    }
    .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(plans)
}

pub fn insert_plan(
    conn: &Connection,
    id: &str,
    project_id: &str,
    title: &str,
    body: &str,
    supersedes: Option<&str>,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sacred_plans (id, project_id, title, body, status, supersedes, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, 'draft', ?5, ?6, ?6)",
        params![id, project_id, title, body, supersedes, now],
    )?;
    Ok(())
}

pub fn update_content(conn: &Connection, plan_id: &str, title: &str, body: &str, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE sacred_plans SET title = ?1, body = ?2, updated_at = ?3 WHERE id = ?4",
        params![title, body, now, plan_id],
    )?;
    Ok(())
}

/// Compare-and-set on status. Returns `false` when the plan was not in `from`.
pub fn transition(
    conn: &Connection,
    plan_id: &str,
    from: PlanStatus,
    to: PlanStatus,
    now: &str,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sacred_plans SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![to.as_str(), now, plan_id, from.as_str()],
    )?;
    Ok(changed == 1)
}

pub fn set_verification_hash(conn: &Connection, plan_id: &str, hash: &str) -> Result<()> {
    conn.execute(
        "UPDATE sacred_plans SET verification_hash = ?1 WHERE id = ?2",
        params![hash, plan_id],
    )?;
    Ok(())
}

pub fn verification_hash(conn: &Connection, plan_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT verification_hash FROM sacred_plans WHERE id = ?1",
            params![plan_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten())
}

pub fn record_approval(conn: &Connection, plan_id: &str, approver: &str, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE sacred_plans SET status = 'approved', approver = ?1, approved_at = ?2, \
         verification_hash = NULL, updated_at = ?2 \
         WHERE id = ?3 AND status = 'pending_approval'",
        params![approver, now, plan_id],
    )?;
    Ok(())
}

pub fn record_lock(conn: &Connection, plan_id: &str, now: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sacred_plans SET status = 'locked', locked_at = ?1, updated_at = ?1 \
         WHERE id = ?2 AND status = 'approved'",
        params![now, plan_id],
    )?;
    Ok(changed == 1)
}

pub fn mark_superseded(conn: &Connection, old_id: &str, new_id: &str, now: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sacred_plans SET status = 'superseded', superseded_by = ?1, updated_at = ?2 \
         WHERE id = ?3 AND status IN ('approved','locked')",
        params![new_id, now, old_id],
    )?;
    Ok(changed == 1)
}

/// Replace a plan's segments and their vectors.
pub fn replace_segments(
    conn: &Connection,
    plan_id: &str,
    segments: &[SegmentCandidate],
    embeddings: &[Vec<f32>],
) -> Result<()> {
    delete_segments(conn, plan_id)?;
    for (segment, embedding) in segments.iter().zip(embeddings) {
        let id = format!("{plan_id}:{}", segment.seq);
        conn.execute(
            "INSERT INTO sacred_segments (id, plan_id, seq, start_line, end_line, text) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                plan_id,
                segment.seq as i64,
                segment.start_line as i64,
                segment.end_line as i64,
                segment.text
            ],
        )?;
        conn.execute(
            "INSERT INTO sacred_vec (id, embedding) VALUES (?1, ?2)",
            params![id, embedding_to_bytes(embedding)],
        )?;
    }
    Ok(())
}

fn delete_segments(conn: &Connection, plan_id: &str) -> Result<()> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM sacred_segments WHERE plan_id = ?1")?;
        let ids = stmt
            .query_map(params![plan_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        ids
    };
    for id in &ids {
        conn.execute("DELETE FROM sacred_vec WHERE id = ?1", params![id])?;
    }
    conn.execute("DELETE FROM sacred_segments WHERE plan_id = ?1", params![plan_id])?;
    Ok(())
}

/// Segments of every plan currently in force, with their stored vectors.
pub fn in_force_segments(conn: &Connection) -> Result<Vec<PlanSegment>> {
    let mut stmt = conn.prepare(
        "SELECT s.plan_id, s.text, v.embedding FROM sacred_segments s \
         JOIN sacred_plans p ON p.id = s.plan_id \
         JOIN sacred_vec v ON v.id = s.id \
         WHERE p.status IN ('approved','locked') \
         ORDER BY s.plan_id, s.seq",
    )?;
    let segments = stmt
        .query_map([], |row| {
            let bytes: Vec<u8> = row.get(2)?;
            Ok(PlanSegment {
                plan_id: row.get(0)?,
                text: row.get(1)?,
                embedding: bytes_to_embedding(&bytes),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(segments)
}

/// kNN over the sacred collection. Returns (plan id, segment text, L2 distance).
pub fn search_segments(
    conn: &Connection,
    embedding: &[f32],
    limit: usize,
) -> Result<Vec<(String, String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT s.plan_id, s.text, v.distance FROM \
         (SELECT id, distance FROM sacred_vec WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2) v \
         JOIN sacred_segments s ON s.id = v.id \
         ORDER BY v.distance",
    )?;
    let rows = stmt
        .query_map(params![embedding_to_bytes(embedding), limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn write_log(
    conn: &Connection,
    plan_id: &str,
    operation: &str,
    actor: Option<&str>,
    details: Option<&serde_json::Value>,
    now: &str,
) -> Result<()> {
    let details = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO plan_log (plan_id, operation, actor, details, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![plan_id, operation, actor, details, now],
    )?;
    Ok(())
}

pub fn read_log(conn: &Connection, plan_id: &str) -> Result<Vec<PlanLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, plan_id, operation, actor, details, created_at FROM plan_log \
         WHERE plan_id = ?1 ORDER BY id",
    )?;
    let entries = stmt
        .query_map(params![plan_id], |row| {
            let details: Option<String> = row.get(4)?;
            Ok(PlanLogEntry {
                id: row.get(0)?,
                plan_id: row.get(1)?,
                operation: row.get(2)?,
                actor: row.get(3)?,
                details: details.and_then(|d| serde_json::from_str(&d).ok()),
                created_at: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}
