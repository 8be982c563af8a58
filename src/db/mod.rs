pub mod migrations;
pub mod schema;

use rusqlite::Connection;
use serde::Serialize;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

use crate::embedding::EmbeddingIdentity;
use crate::error::{CanonError, Result};

static SQLITE_VEC_INIT: Once = Once::new();

/// Which of the three database layouts a connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Registry,
    Knowledge,
    Sacred,
}

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

fn open_connection(path: &Path) -> Result<Connection> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path)?;

    // Enable WAL mode for better concurrent read performance
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;
    Ok(conn)
}

/// Open (or create) the project registry at the given path.
pub fn open_registry_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    let mut conn = open_connection(path)?;
    schema::init_schema(&conn, DbKind::Registry, 0)?;
    migrations::run_migrations(&mut conn, DbKind::Registry)?;

    tracing::info!(path = %path.display(), "registry initialized");
    Ok(conn)
}

/// Open (or create) a per-project index database (knowledge or sacred).
///
/// Fails with a consistency error when the database was built with a
/// different embedding dimension count.
pub fn open_index_database(
    path: impl AsRef<Path>,
    kind: DbKind,
    identity: &EmbeddingIdentity,
) -> Result<Connection> {
    let path = path.as_ref();
    let mut conn = open_connection(path)?;
    prepare_index(&mut conn, kind, identity)?;

    tracing::debug!(path = %path.display(), ?kind, "index database opened");
    Ok(conn)
}

/// Open an in-memory database of any kind, schema and migrations applied.
pub fn open_memory_database(kind: DbKind, identity: &EmbeddingIdentity) -> Result<Connection> {
    load_sqlite_vec();
    let mut conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    match kind {
        DbKind::Registry => {
            schema::init_schema(&conn, kind, 0)?;
            migrations::run_migrations(&mut conn, kind)?;
        }
        _ => prepare_index(&mut conn, kind, identity)?,
    }
    Ok(conn)
}

fn prepare_index(conn: &mut Connection, kind: DbKind, identity: &EmbeddingIdentity) -> Result<()> {
    if let Some(stored) = migrations::get_embedding_dimensions_if_present(conn)? {
        if stored != identity.dimensions {
            return Err(CanonError::consistency(format!(
                "index was built with {stored}-dimensional embeddings, provider produces {}",
                identity.dimensions
            )));
        }
    }

    schema::init_schema(conn, kind, identity.dimensions)?;
    migrations::run_migrations(conn, kind)?;

    match migrations::get_embedding_model(conn)? {
        None => migrations::set_embedding_identity(conn, &identity.model, identity.dimensions)?,
        Some(stored) if stored != identity.model => {
            tracing::warn!(stored = %stored, configured = %identity.model, "embedding model mismatch, similarity scores may degrade");
        }
        Some(_) => {}
    }
    Ok(())
}

/// Diagnostics for one database file.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    pub schema_version: u32,
    pub sqlite_vec_version: String,
    pub embedding_model: Option<String>,
    pub embedding_dimensions: Option<usize>,
    pub integrity_ok: bool,
    pub integrity_details: String,
}

/// Run `PRAGMA integrity_check` and collect schema metadata.
pub fn check_database_health(conn: &Connection) -> Result<DatabaseHealth> {
    let schema_version = migrations::get_schema_version(conn)?;
    let sqlite_vec_version: String = conn.query_row("SELECT vec_version()", [], |r| r.get(0))?;
    let embedding_model = migrations::get_embedding_model(conn)?;
    let embedding_dimensions = migrations::get_embedding_dimensions(conn)?;

    let integrity_details: String =
        conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
    let integrity_ok = integrity_details == "ok";

    Ok(DatabaseHealth {
        schema_version,
        sqlite_vec_version,
        embedding_model,
        embedding_dimensions,
        integrity_ok,
        integrity_details,
    })
}
