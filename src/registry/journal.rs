//! Append-only decisions and forward-only objectives.
//!
//! Neither table has an update or delete path here; the v2 triggers refuse
//! them at the storage layer as well.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::projects::get_project;
use super::types::{Decision, Objective, Priority, ProjectStatus};
use crate::error::{CanonError, Result};

fn require_writable(conn: &Connection, project_id: &str) -> Result<()> {
    let project = get_project(conn, project_id)?;
    if project.status == ProjectStatus::Archived {
        return Err(CanonError::consistency(format!(
            "project {project_id} is archived"
        )));
    }
    Ok(())
}

pub fn add_decision(
    conn: &Connection,
    project_id: &str,
    title: &str,
    rationale: &str,
    author: Option<&str>,
) -> Result<Decision> {
    if title.trim().is_empty() {
        return Err(CanonError::validation("decision title must not be empty"));
    }
    if rationale.trim().is_empty() {
        return Err(CanonError::validation("decision rationale must not be empty"));
    }
    require_writable(conn, project_id)?;

    let decision = Decision {
        id: uuid::Uuid::now_v7().to_string(),
        project_id: project_id.to_string(),
        title: title.trim().to_string(),
        rationale: rationale.to_string(),
        author: author.map(str::to_string),
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    conn.execute(
        "INSERT INTO decisions (id, project_id, title, rationale, author, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            decision.id,
            decision.project_id,
            decision.title,
            decision.rationale,
            decision.author,
            decision.created_at,
        ],
    )?;

    tracing::info!(project_id = %project_id, decision_id = %decision.id, "decision recorded");
    Ok(decision)
}

/// Decisions in the order they were recorded.
pub fn list_decisions(conn: &Connection, project_id: &str) -> Result<Vec<Decision>> {
    get_project(conn, project_id)?;
    let mut stmt = conn.prepare(
        "SELECT id, project_id, title, rationale, author, created_at FROM decisions \
         WHERE project_id = ?1 ORDER BY created_at, id",
    )?;
    let decisions = stmt
        .query_map(params![project_id], |row| {
            Ok(Decision {
                id: row.get(0)?,
                project_id: row.get(1)?,
                title: row.get(2)?,
                rationale: row.get(3)?,
                author: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(decisions)
}

const OBJECTIVE_COLUMNS: &str =
    "id, project_id, title, description, priority, completed, completed_at, created_at";

fn row_to_objective(row: &Row<'_>) -> rusqlite::Result<Objective> {
    let priority: String = row.get(4)?;
    Ok(Objective {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        priority: priority.parse().unwrap_or(Priority::Medium),
        completed: row.get::<_, i64>(5)? != 0,
        completed_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub fn add_objective(
    conn: &Connection,
    project_id: &str,
    title: &str,
    description: &str,
    priority: Priority,
) -> Result<Objective> {
    if title.trim().is_empty() {
        return Err(CanonError::validation("objective title must not be empty"));
    }
    require_writable(conn, project_id)?;

    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO objectives (id, project_id, title, description, priority, completed, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![id, project_id, title.trim(), description, priority.as_str(), now],
    )?;

    tracing::info!(project_id = %project_id, objective_id = %id, %priority, "objective added");
    get_objective(conn, project_id, &id)
}

fn get_objective(conn: &Connection, project_id: &str, objective_id: &str) -> Result<Objective> {
    conn.query_row(
        &format!("SELECT {OBJECTIVE_COLUMNS} FROM objectives WHERE id = ?1 AND project_id = ?2"),
        params![objective_id, project_id],
        row_to_objective,
    )
    .optional()?
    .ok_or_else(|| CanonError::not_found("objective", objective_id))
}

/// Objectives by priority (critical first), then age.
pub fn list_objectives(
    conn: &Connection,
    project_id: &str,
    pending_only: bool,
) -> Result<Vec<Objective>> {
    get_project(conn, project_id)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {OBJECTIVE_COLUMNS} FROM objectives \
         WHERE project_id = ?1 AND (?2 = 0 OR completed = 0) \
         ORDER BY CASE priority WHEN 'critical' THEN 0 WHEN 'high' THEN 1 WHEN 'medium' THEN 2 ELSE 3 END, \
         created_at, id"
    ))?;
    let objectives = stmt
        .query_map(params![project_id, pending_only], row_to_objective)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(objectives)
}

/// Mark an objective complete. Completing an already-completed objective is a no-op.
pub fn complete_objective(
    conn: &Connection,
    project_id: &str,
    objective_id: &str,
) -> Result<Objective> {
    let objective = get_objective(conn, project_id, objective_id)?;
    if objective.completed {
        return Ok(objective);
    }
    conn.execute(
        "UPDATE objectives SET completed = 1, completed_at = ?1 WHERE id = ?2 AND completed = 0",
        params![chrono::Utc::now().to_rfc3339(), objective_id],
    )?;

    tracing::info!(project_id = %project_id, objective_id = %objective_id, "objective completed");
    get_objective(conn, project_id, objective_id)
}
