//! Project lifecycle and focus.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::types::{Project, ProjectStatus};
use crate::error::{CanonError, Result};

const FOCUS_KEY: &str = "focused_project";

const PROJECT_COLUMNS: &str =
    "id, name, root_path, status, watch_paths, created_at, last_active_at, archived_at";

fn row_to_project(row: &Row<'_>, focused_id: Option<&str>) -> rusqlite::Result<Project> {
    let id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let watch_paths: String = row.get(4)?;
    Ok(Project {
        focused: focused_id == Some(id.as_str()),
        name: row.get(1)?,
        root_path: row.get(2)?,
        status: status.parse().unwrap_or(ProjectStatus::Active),
        watch_paths: serde_json::from_str(&watch_paths).unwrap_or_default(),
        created_at: row.get(5)?,
        last_active_at: row.get(6)?,
        archived_at: row.get(7)?,
        id,
    })
}

fn focused_id(conn: &Connection) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM registry_state WHERE key = ?1",
            params![FOCUS_KEY],
            |row| row.get(0),
        )
        .optional()?)
}

/// Register a new project. Names must be non-blank and unique.
pub fn create_project(
    conn: &mut Connection,
    name: &str,
    root_path: &str,
    watch_paths: &[String],
) -> Result<Project> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CanonError::validation("project name must not be empty"));
    }
    if root_path.trim().is_empty() {
        return Err(CanonError::validation("project root path must not be empty"));
    }

    let tx = conn.transaction()?;
    let taken: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM projects WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    if taken {
        return Err(CanonError::consistency(format!(
            "a project named {name:?} already exists"
        )));
    }

    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO projects (id, name, root_path, status, watch_paths, created_at, last_active_at) \
         VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)",
        params![id, name, root_path, serde_json::to_string(watch_paths)?, now],
    )?;
    tx.commit()?;

    tracing::info!(project_id = %id, name = %name, "project created");
    get_project(conn, &id)
}

/// Fetch one project. Unknown ids are a not-found error.
pub fn get_project(conn: &Connection, id: &str) -> Result<Project> {
    let focused = focused_id(conn)?;
    conn.query_row(
        &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
        params![id],
        |row| row_to_project(row, focused.as_deref()),
    )
    .optional()?
    .ok_or_else(|| CanonError::not_found("project", id))
}

pub fn find_project_by_name(conn: &Connection, name: &str) -> Result<Option<Project>> {
    let focused = focused_id(conn)?;
    Ok(conn
        .query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE name = ?1"),
            params![name],
            |row| row_to_project(row, focused.as_deref()),
        )
        .optional()?)
}

/// List projects, oldest first, optionally restricted to one status.
pub fn list_projects(conn: &Connection, status: Option<ProjectStatus>) -> Result<Vec<Project>> {
    let focused = focused_id(conn)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROJECT_COLUMNS} FROM projects \
         WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at, id"
    ))?;
    let projects = stmt
        .query_map(params![status.map(|s| s.as_str())], |row| {
            row_to_project(row, focused.as_deref())
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(projects)
}

/// Move a project to `target`. Same-state requests succeed without writing.
///
/// Archiving the focused project clears the focus in the same transaction.
pub fn set_status(conn: &mut Connection, id: &str, target: ProjectStatus) -> Result<Project> {
    let tx = conn.transaction()?;
    let current: Option<String> = tx
        .query_row(
            "SELECT status FROM projects WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let current: ProjectStatus = current
        .ok_or_else(|| CanonError::not_found("project", id))?
        .parse()
        .map_err(CanonError::consistency)?;

    if current == target {
        drop(tx);
        return get_project(conn, id);
    }
    if !current.can_transition_to(target) {
        return Err(CanonError::consistency(format!(
            "cannot move project {id} from {current} to {target}"
        )));
    }

    let now = chrono::Utc::now().to_rfc3339();
    match target {
        ProjectStatus::Archived => {
            tx.execute(
                "UPDATE projects SET status = 'archived', archived_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            tx.execute(
                "DELETE FROM registry_state WHERE key = ?1 AND value = ?2",
                params![FOCUS_KEY, id],
            )?;
        }
        other => {
            tx.execute(
                "UPDATE projects SET status = ?1, archived_at = NULL, last_active_at = ?2 WHERE id = ?3",
                params![other.as_str(), now, id],
            )?;
        }
    }
    tx.commit()?;

    tracing::info!(project_id = %id, from = %current, to = %target, "project status changed");
    get_project(conn, id)
}

/// Make `id` the focused project. Any previous focus is replaced in the same
/// write, so at most one project is ever focused.
pub fn focus_project(conn: &mut Connection, id: &str) -> Result<Project> {
    let tx = conn.transaction()?;
    let status: Option<String> = tx
        .query_row(
            "SELECT status FROM projects WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match status.as_deref() {
        None => return Err(CanonError::not_found("project", id)),
        Some("archived") => {
            return Err(CanonError::consistency(format!(
                "cannot focus archived project {id}"
            )))
        }
        Some(_) => {}
    }

    tx.execute(
        "INSERT OR REPLACE INTO registry_state (key, value) VALUES (?1, ?2)",
        params![FOCUS_KEY, id],
    )?;
    tx.execute(
        "UPDATE projects SET last_active_at = ?1 WHERE id = ?2",
        params![chrono::Utc::now().to_rfc3339(), id],
    )?;
    tx.commit()?;

    tracing::info!(project_id = %id, "project focused");
    get_project(conn, id)
}

pub fn clear_focus(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM registry_state WHERE key = ?1", params![FOCUS_KEY])?;
    Ok(())
}

pub fn focused_project(conn: &Connection) -> Result<Option<Project>> {
    match focused_id(conn)? {
        Some(id) => Ok(Some(get_project(conn, &id)?)),
        None => Ok(None),
    }
}

/// Bump `last_active_at`.
pub fn touch_project(conn: &Connection, id: &str) -> Result<()> {
    let rows = conn.execute(
        "UPDATE projects SET last_active_at = ?1 WHERE id = ?2",
        params![chrono::Utc::now().to_rfc3339(), id],
    )?;
    if rows == 0 {
        return Err(CanonError::not_found("project", id));
    }
    Ok(())
}

pub fn set_watch_paths(conn: &Connection, id: &str, watch_paths: &[String]) -> Result<Project> {
    let rows = conn.execute(
        "UPDATE projects SET watch_paths = ?1 WHERE id = ?2",
        params![serde_json::to_string(watch_paths)?, id],
    )?;
    if rows == 0 {
        return Err(CanonError::not_found("project", id));
    }
    get_project(conn, id)
}

/// Count projects per status: (active, paused, archived).
pub fn count_by_status(conn: &Connection) -> Result<(usize, usize, usize)> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM projects GROUP BY status")?;
    let mut counts = (0, 0, 0);
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (status, n) = row?;
        match status.as_str() {
            "active" => counts.0 = n as usize,
            "paused" => counts.1 = n as usize,
            "archived" => counts.2 = n as usize,
            _ => {}
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, DbKind};
    use crate::embedding::EmbeddingIdentity;

    fn test_db() -> Connection {
        let identity = EmbeddingIdentity {
            model: "unused".into(),
            dimensions: 0,
        };
        db::open_memory_database(DbKind::Registry, &identity).unwrap()
    }

    #[test]
    fn create_and_get() {
        let mut conn = test_db();
        let p = create_project(&mut conn, "demo", "/tmp/demo", &["src".into()]).unwrap();
        assert_eq!(p.status, ProjectStatus::Active);
        assert!(!p.focused);
        assert_eq!(p.watch_paths, vec!["src".to_string()]);

        let fetched = get_project(&conn, &p.id).unwrap();
        assert_eq!(fetched.name, "demo");
        assert_eq!(
            find_project_by_name(&conn, "demo").unwrap().unwrap().id,
            p.id
        );
    }

    #[test]
    fn names_are_unique_and_non_blank() {
        let mut conn = test_db();
        create_project(&mut conn, "demo", "/a", &[]).unwrap();
        assert_eq!(
            create_project(&mut conn, "demo", "/b", &[]).unwrap_err().kind(),
            "consistency_error"
        );
        assert_eq!(
            create_project(&mut conn, "  ", "/b", &[]).unwrap_err().kind(),
            "validation_error"
        );
    }

    #[test]
    fn unknown_project_is_not_found() {
        let mut conn = test_db();
        assert_eq!(get_project(&conn, "nope").unwrap_err().kind(), "not_found_error");
        assert_eq!(
            set_status(&mut conn, "nope", ProjectStatus::Paused)
                .unwrap_err()
                .kind(),
            "not_found_error"
        );
    }

    #[test]
    fn lifecycle_transitions() {
        let mut conn = test_db();
        let p = create_project(&mut conn, "demo", "/tmp/demo", &[]).unwrap();

        let paused = set_status(&mut conn, &p.id, ProjectStatus::Paused).unwrap();
        assert_eq!(paused.status, ProjectStatus::Paused);
        // Idempotent
        set_status(&mut conn, &p.id, ProjectStatus::Paused).unwrap();

        let archived = set_status(&mut conn, &p.id, ProjectStatus::Archived).unwrap();
        assert_eq!(archived.status, ProjectStatus::Archived);
        assert!(archived.archived_at.is_some());

        // archived -> paused is not a legal step
        let err = set_status(&mut conn, &p.id, ProjectStatus::Paused).unwrap_err();
        assert_eq!(err.kind(), "consistency_error");

        let restored = set_status(&mut conn, &p.id, ProjectStatus::Active).unwrap();
        assert_eq!(restored.status, ProjectStatus::Active);
        assert!(restored.archived_at.is_none());
    }

    #[test]
    fn focus_is_exclusive() {
        let mut conn = test_db();
        let a = create_project(&mut conn, "a", "/a", &[]).unwrap();
        let b = create_project(&mut conn, "b", "/b", &[]).unwrap();

        focus_project(&mut conn, &a.id).unwrap();
        focus_project(&mut conn, &b.id).unwrap();

        let focused: Vec<String> = list_projects(&conn, None)
            .unwrap()
            .into_iter()
            .filter(|p| p.focused)
            .map(|p| p.id)
            .collect();
        assert_eq!(focused, vec![b.id.clone()]);
        assert_eq!(focused_project(&conn).unwrap().unwrap().id, b.id);
    }

    #[test]
    fn archiving_focused_project_clears_focus() {
        let mut conn = test_db();
        let a = create_project(&mut conn, "a", "/a", &[]).unwrap();
        focus_project(&mut conn, &a.id).unwrap();
        set_status(&mut conn, &a.id, ProjectStatus::Archived).unwrap();
        assert!(focused_project(&conn).unwrap().is_none());

        let err = focus_project(&mut conn, &a.id).unwrap_err();
        assert_eq!(err.kind(), "consistency_error");
    }

    #[test]
    fn list_filters_by_status_and_counts() {
        let mut conn = test_db();
        let a = create_project(&mut conn, "a", "/a", &[]).unwrap();
        create_project(&mut conn, "b", "/b", &[]).unwrap();
        set_status(&mut conn, &a.id, ProjectStatus::Paused).unwrap();

        let paused = list_projects(&conn, Some(ProjectStatus::Paused)).unwrap();
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].id, a.id);
        assert_eq!(count_by_status(&conn).unwrap(), (1, 1, 0));
    }
}
