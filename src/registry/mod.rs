//! Project registry: lifecycle, focus, decisions, objectives and the sacred
//! plan directory, all in `registry.db`.
//!
//! The free functions in [`projects`] and [`journal`] operate on a bare
//! [`Connection`]; [`ProjectRegistry`] owns the connection and serializes access.

pub mod journal;
pub mod projects;
pub mod types;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{self, DbKind};
use crate::embedding::EmbeddingIdentity;
use crate::error::{CanonError, Result};
use types::{Decision, Objective, Priority, Project, ProjectStatus};

pub struct ProjectRegistry {
    conn: Mutex<Connection>,
}

impl ProjectRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::open_registry_database(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let identity = EmbeddingIdentity {
            model: String::new(),
            dimensions: 0,
        };
        Ok(Self {
            conn: Mutex::new(db::open_memory_database(DbKind::Registry, &identity)?),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CanonError::internal(format!("registry lock poisoned: {e}")))
    }

    pub fn create_project(
        &self,
        name: &str,
        root_path: &str,
        watch_paths: &[String],
    ) -> Result<Project> {
        projects::create_project(&mut *self.lock()?, name, root_path, watch_paths)
    }

    pub fn get_project(&self, id: &str) -> Result<Project> {
        projects::get_project(&*self.lock()?, id)
    }

    pub fn find_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        projects::find_project_by_name(&*self.lock()?, name)
    }

    pub fn list_projects(&self, status: Option<ProjectStatus>) -> Result<Vec<Project>> {
        projects::list_projects(&*self.lock()?, status)
    }

    pub fn pause_project(&self, id: &str) -> Result<Project> {
        projects::set_status(&mut *self.lock()?, id, ProjectStatus::Paused)
    }

    pub fn resume_project(&self, id: &str) -> Result<Project> {
        let mut conn = self.lock()?;
        let current = projects::get_project(&conn, id)?;
        if current.status == ProjectStatus::Archived {
            return Err(CanonError::consistency(format!(
                "project {id} is archived; unarchive it instead"
            )));
        }
        projects::set_status(&mut conn, id, ProjectStatus::Active)
    }

    pub fn archive_project(&self, id: &str) -> Result<Project> {
        projects::set_status(&mut *self.lock()?, id, ProjectStatus::Archived)
    }

    pub fn unarchive_project(&self, id: &str) -> Result<Project> {
        let mut conn = self.lock()?;
        let current = projects::get_project(&conn, id)?;
        if current.status != ProjectStatus::Archived {
            return Err(CanonError::consistency(format!(
                "project {id} is {}, not archived",
                current.status
            )));
        }
        projects::set_status(&mut conn, id, ProjectStatus::Active)
    }

    pub fn focus_project(&self, id: &str) -> Result<Project> {
        projects::focus_project(&mut *self.lock()?, id)
    }

    pub fn clear_focus(&self) -> Result<()> {
        projects::clear_focus(&*self.lock()?)
    }

    pub fn focused_project(&self) -> Result<Option<Project>> {
        projects::focused_project(&*self.lock()?)
    }

    pub fn touch_project(&self, id: &str) -> Result<()> {
        projects::touch_project(&*self.lock()?, id)
    }

    pub fn set_watch_paths(&self, id: &str, watch_paths: &[String]) -> Result<Project> {
        projects::set_watch_paths(&*self.lock()?, id, watch_paths)
    }

    pub fn count_by_status(&self) -> Result<(usize, usize, usize)> {
        projects::count_by_status(&*self.lock()?)
    }

    pub fn add_decision(
        &self,
        project_id: &str,
        title: &str,
        rationale: &str,
        author: Option<&str>,
    ) -> Result<Decision> {
        journal::add_decision(&*self.lock()?, project_id, title, rationale, author)
    }

    pub fn list_decisions(&self, project_id: &str) -> Result<Vec<Decision>> {
        journal::list_decisions(&*self.lock()?, project_id)
    }

    pub fn add_objective(
        &self,
        project_id: &str,
        title: &str,
        description: &str,
        priority: Priority,
    ) -> Result<Objective> {
        journal::add_objective(&*self.lock()?, project_id, title, description, priority)
    }

    pub fn list_objectives(&self, project_id: &str, pending_only: bool) -> Result<Vec<Objective>> {
        journal::list_objectives(&*self.lock()?, project_id, pending_only)
    }

    pub fn complete_objective(&self, project_id: &str, objective_id: &str) -> Result<Objective> {
        journal::complete_objective(&*self.lock()?, project_id, objective_id)
    }

    /// Record which project owns a sacred plan. Re-registering the same pair is a no-op.
    pub fn register_plan(&self, plan_id: &str, project_id: &str) -> Result<()> {
        let conn = self.lock()?;
        match plan_owner(&conn, plan_id)? {
            Some(owner) if owner != project_id => Err(CanonError::consistency(format!(
                "plan {plan_id} already belongs to project {owner}"
            ))),
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO plan_directory (plan_id, project_id, created_at) VALUES (?1, ?2, ?3)",
                    params![plan_id, project_id, chrono::Utc::now().to_rfc3339()],
                )?;
                Ok(())
            }
        }
    }

    /// Owning project of a plan. Unknown plan ids are a not-found error.
    pub fn plan_owner(&self, plan_id: &str) -> Result<String> {
        plan_owner(&*self.lock()?, plan_id)?.ok_or_else(|| CanonError::not_found("sacred plan", plan_id))
    }

    pub fn health(&self) -> Result<RegistryHealth> {
        let conn = self.lock()?;
        let database = db::check_database_health(&conn)?;
        let (active, paused, archived) = projects::count_by_status(&conn)?;
        Ok(RegistryHealth {
            database,
            active,
            paused,
            archived,
        })
    }
}

fn plan_owner(conn: &Connection, plan_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT project_id FROM plan_directory WHERE plan_id = ?1",
            params![plan_id],
            |row| row.get(0),
        )
        .optional()?)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryHealth {
    pub database: db::DatabaseHealth,
    pub active: usize,
    pub paused: usize,
    pub archived: usize,
}
