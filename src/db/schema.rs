//! SQL DDL for the three database kinds.
//!
//! `registry.db` holds projects, decisions, objectives, focus state and the
//! plan directory. Each project owns a `knowledge.db` (files, segments,
//! `segments_vec`) and a `sacred.db` (sacred_plans, sacred_segments,
//! `sacred_vec`, plan_log). All DDL uses `IF NOT EXISTS` for idempotent
//! initialization.

use rusqlite::Connection;

use super::DbKind;

const REGISTRY_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    root_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','paused','archived')),
    watch_paths TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL,
    archived_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status);

-- Append-only decision log
CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    title TEXT NOT NULL,
    rationale TEXT NOT NULL,
    author TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decisions_project ON decisions(project_id);

CREATE TABLE IF NOT EXISTS objectives (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    priority TEXT NOT NULL DEFAULT 'medium' CHECK(priority IN ('low','medium','high','critical')),
    completed INTEGER NOT NULL DEFAULT 0 CHECK(completed IN (0, 1)),
    completed_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_objectives_project ON objectives(project_id);

-- Singleton registry fields ('focused_project')
CREATE TABLE IF NOT EXISTS registry_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Sacred plan id -> owning project
CREATE TABLE IF NOT EXISTS plan_directory (
    plan_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_plan_directory_project ON plan_directory(project_id);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const KNOWLEDGE_SCHEMA_SQL: &str = r#"
-- One row per indexed file; content_hash is written after the file's last batch
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    segment_count INTEGER NOT NULL,
    indexed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS segments (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    file_path TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('code','document')),
    text_hash TEXT NOT NULL,
    text TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_segments_file ON segments(file_path);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const SACRED_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sacred_plans (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft'
        CHECK(status IN ('draft','pending_approval','approved','locked','superseded')),
    verification_hash TEXT,
    approver TEXT,
    approved_at TEXT,
    locked_at TEXT,
    supersedes TEXT,
    superseded_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sacred_plans_status ON sacred_plans(status);

CREATE TABLE IF NOT EXISTS sacred_segments (
    id TEXT PRIMARY KEY,
    plan_id TEXT NOT NULL REFERENCES sacred_plans(id),
    seq INTEGER NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    text TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sacred_segments_plan ON sacred_segments(plan_id);

-- Audit log
CREATE TABLE IF NOT EXISTS plan_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    plan_id TEXT NOT NULL,
    operation TEXT NOT NULL
        CHECK(operation IN ('create','edit','submit','approve','reject','lock','supersede')),
    actor TEXT,
    details TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_plan_log_plan ON plan_log(plan_id);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual tables must be created separately (sqlite-vec syntax).
fn vec_table_sql(table: &str, dimensions: usize) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS {table} USING vec0(\n    id TEXT PRIMARY KEY,\n    embedding FLOAT[{dimensions}]\n);"
    )
}

/// Name of the vector table for an index kind. The registry has none.
pub fn vec_table(kind: DbKind) -> Option<&'static str> {
    match kind {
        DbKind::Registry => None,
        DbKind::Knowledge => Some("segments_vec"),
        DbKind::Sacred => Some("sacred_vec"),
    }
}

/// Initialize all tables for `kind`. Idempotent (uses IF NOT EXISTS).
///
/// `dimensions` sizes the vec0 table and is ignored for the registry.
pub fn init_schema(conn: &Connection, kind: DbKind, dimensions: usize) -> rusqlite::Result<()> {
    let sql = match kind {
        DbKind::Registry => REGISTRY_SCHEMA_SQL,
        DbKind::Knowledge => KNOWLEDGE_SCHEMA_SQL,
        DbKind::Sacred => SACRED_SCHEMA_SQL,
    };
    conn.execute_batch(sql)?;

    if let Some(table) = vec_table(kind) {
        conn.execute_batch(&vec_table_sql(table, dimensions))?;
    }

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
