//! Forward-only schema migration framework.
//!
//! Tracks the schema version in `schema_meta` and runs sequential migrations
//! to bring the database up to [`CURRENT_SCHEMA_VERSION`]. Index databases also
//! record the embedding identity their vectors were produced with.

use rusqlite::{Connection, OptionalExtension};

use super::DbKind;

/// The schema version that the current binary expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Get the current schema version from the database.
pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'schema_version'",
        [],
        |row| {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().unwrap_or(0))
        },
    )
}

/// Update the stored schema version.
fn update_schema_version(conn: &Connection, version: u32) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE schema_meta SET value = ?1 WHERE key = 'schema_version'",
        [version.to_string()],
    )?;
    Ok(())
}

fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = ?1",
        [key],
        |row| row.get::<_, String>(0),
    )
    .optional()
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

/// Get the stored embedding model identifier, if any.
pub fn get_embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    get_meta(conn, "embedding_model")
}

/// Get the stored embedding dimension count, if any.
pub fn get_embedding_dimensions(conn: &Connection) -> rusqlite::Result<Option<usize>> {
    Ok(get_meta(conn, "embedding_dimensions")?.and_then(|v| v.parse().ok()))
}

/// Like [`get_embedding_dimensions`], but tolerates a database whose schema
/// has not been created yet.
pub fn get_embedding_dimensions_if_present(conn: &Connection) -> rusqlite::Result<Option<usize>> {
    let has_meta: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_meta')",
        [],
        |row| row.get(0),
    )?;
    if !has_meta {
        return Ok(None);
    }
    get_embedding_dimensions(conn)
}

/// Record the embedding identity an index was built with.
pub fn set_embedding_identity(
    conn: &Connection,
    model: &str,
    dimensions: usize,
) -> rusqlite::Result<()> {
    set_meta(conn, "embedding_model", model)?;
    set_meta(conn, "embedding_dimensions", &dimensions.to_string())
}

/// Run any pending forward-only migrations. Each migration runs in a transaction.
pub fn run_migrations(conn: &mut Connection, kind: DbKind) -> rusqlite::Result<()> {
    let mut version = get_schema_version(conn)?;
    tracing::debug!(schema_version = version, target = CURRENT_SCHEMA_VERSION, ?kind, "checking migrations");

    while version < CURRENT_SCHEMA_VERSION {
        let next = version + 1;
        tracing::info!(from = version, to = next, ?kind, "running migration");

        let tx = conn.transaction()?;
        match next {
            2 => migrate_v1_to_v2(&tx, kind)?,
            _ => {
                tracing::error!(version = next, "unknown migration target");
                break;
            }
        }
        update_schema_version(&tx, next)?;
        tx.commit()?;
        version = next;
    }

    Ok(())
}

/// Migration v1 → v2: guard triggers.
///
/// Sacred plan content cannot change once approved, decisions are append-only
/// and objectives cannot be un-completed, even through raw SQL.
fn migrate_v1_to_v2(conn: &Connection, kind: DbKind) -> rusqlite::Result<()> {
    match kind {
        DbKind::Registry => conn.execute_batch(
            r#"
CREATE TRIGGER IF NOT EXISTS decisions_no_update
BEFORE UPDATE ON decisions
BEGIN
    SELECT RAISE(ABORT, 'decisions are append-only');
END;

CREATE TRIGGER IF NOT EXISTS decisions_no_delete
BEFORE DELETE ON decisions
BEGIN
    SELECT RAISE(ABORT, 'decisions are append-only');
END;

CREATE TRIGGER IF NOT EXISTS objectives_forward_only
BEFORE UPDATE OF completed ON objectives
WHEN OLD.completed = 1 AND NEW.completed = 0
BEGIN
    SELECT RAISE(ABORT, 'objectives cannot be un-completed');
END;
"#,
        ),
        DbKind::Knowledge => conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_segments_file_hash ON segments(file_path, text_hash);",
        ),
        DbKind::Sacred => conn.execute_batch(
            r#"
CREATE TRIGGER IF NOT EXISTS sacred_plans_content_immutable
BEFORE UPDATE OF title, body ON sacred_plans
WHEN OLD.status IN ('approved','locked','superseded')
BEGIN
    SELECT RAISE(ABORT, 'sacred plan content is immutable once approved');
END;

CREATE TRIGGER IF NOT EXISTS sacred_plans_status_forward_only
BEFORE UPDATE OF status ON sacred_plans
WHEN (OLD.status = 'superseded' AND NEW.status != 'superseded')
  OR (OLD.status IN ('approved','locked') AND NEW.status IN ('draft','pending_approval'))
  OR (OLD.status = 'locked' AND NEW.status = 'approved')
BEGIN
    SELECT RAISE(ABORT, 'illegal sacred plan status transition');
END;

CREATE TRIGGER IF NOT EXISTS sacred_plans_no_delete
BEFORE DELETE ON sacred_plans
BEGIN
    SELECT RAISE(ABORT, 'sacred plans are retained for audit');
END;
"#,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db(kind: DbKind) -> Connection {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        crate::db::schema::init_schema(&conn, kind, 8).unwrap();
        conn
    }

    #[test]
    fn get_schema_version_returns_1_on_fresh_db() {
        let conn = test_db(DbKind::Knowledge);
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn run_migrations_upgrades_to_current() {
        for kind in [DbKind::Registry, DbKind::Knowledge, DbKind::Sacred] {
            let mut conn = test_db(kind);
            run_migrations(&mut conn, kind).unwrap();
            assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = test_db(DbKind::Sacred);
        run_migrations(&mut conn, DbKind::Sacred).unwrap();
        run_migrations(&mut conn, DbKind::Sacred).unwrap(); // second call should not error
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn set_and_get_embedding_identity() {
        let conn = test_db(DbKind::Knowledge);
        assert!(get_embedding_model(&conn).unwrap().is_none());
        assert!(get_embedding_dimensions(&conn).unwrap().is_none());

        set_embedding_identity(&conn, "canon-hashing-v1", 384).unwrap();
        assert_eq!(
            get_embedding_model(&conn).unwrap(),
            Some("canon-hashing-v1".to_string())
        );
        assert_eq!(get_embedding_dimensions(&conn).unwrap(), Some(384));
    }

    #[test]
    fn decision_trigger_refuses_updates() {
        let mut conn = test_db(DbKind::Registry);
        run_migrations(&mut conn, DbKind::Registry).unwrap();

        conn.execute(
            "INSERT INTO projects (id, name, root_path, created_at, last_active_at) VALUES ('p', 'p', '/tmp', 'now', 'now')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO decisions (id, project_id, title, rationale, created_at) VALUES ('d', 'p', 'Use SQLite', 'simple', 'now')",
            [],
        )
        .unwrap();

        assert!(conn
            .execute("UPDATE decisions SET title = 'Use Postgres' WHERE id = 'd'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM decisions WHERE id = 'd'", []).is_err());
    }

    #[test]
    fn sacred_trigger_refuses_body_edit_after_approval() {
        let mut conn = test_db(DbKind::Sacred);
        run_migrations(&mut conn, DbKind::Sacred).unwrap();

        conn.execute(
            "INSERT INTO sacred_plans (id, project_id, title, body, status, created_at, updated_at) \
             VALUES ('x', 'p', 'Auth', 'tokens', 'approved', 'now', 'now')",
            [],
        )
        .unwrap();

        assert!(conn
            .execute("UPDATE sacred_plans SET body = 'sessions' WHERE id = 'x'", [])
            .is_err());
        assert!(conn
            .execute("UPDATE sacred_plans SET status = 'draft' WHERE id = 'x'", [])
            .is_err());
        // Forward transitions stay legal
        conn.execute("UPDATE sacred_plans SET status = 'locked' WHERE id = 'x'", [])
            .unwrap();
    }
}
