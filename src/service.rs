//! Async facade over the core.
//!
//! [`Canon`] wires registry, knowledge orchestrator, sacred plan store and
//! drift detector around one configuration. Every call runs its blocking
//! SQLite and embedding work on `spawn_blocking`, so the facade can be shared
//! freely across tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityReader, GitLogReader};
use crate::config::CanonConfig;
use crate::db::DatabaseHealth;
use crate::drift::report::DriftReport;
use crate::drift::DriftDetector;
use crate::embedding::{create_provider, EmbeddingGateway, EmbeddingIdentity, EmbeddingProvider};
use crate::error::{CanonError, Result};
use crate::knowledge::index::IndexStats;
use crate::knowledge::ingest::IngestSummary;
use crate::knowledge::jobs::{JobHandle, JobStatus};
use crate::knowledge::query::{QueryRequest, QueryResponse};
use crate::knowledge::KnowledgeOrchestrator;
use crate::llm::LanguageModel;
use crate::registry::types::{Decision, Objective, Priority, Project, ProjectStatus};
use crate::registry::ProjectRegistry;
use crate::retry::RetryPolicy;
use crate::sacred::types::{ApprovalSecret, PlanHit, PlanLogEntry, PlanStatus, SacredPlan, SubmitReceipt};
use crate::sacred::SacredPlanStore;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub database: DatabaseHealth,
    pub embedding: EmbeddingIdentity,
    pub projects_active: usize,
    pub projects_paused: usize,
    pub projects_archived: usize,
    pub approval_secret_configured: bool,
}

/// Collaborators for [`Canon`]. Anything left unset falls back to the
/// configured default.
pub struct CanonBuilder {
    config: CanonConfig,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    reader: Option<Arc<dyn ActivityReader>>,
    language_model: Option<Arc<dyn LanguageModel>>,
    approval_secret: Option<ApprovalSecret>,
    retry: Option<RetryPolicy>,
}

impl CanonBuilder {
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn activity_reader(mut self, reader: Arc<dyn ActivityReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn language_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.language_model = Some(model);
        self
    }

    pub fn approval_secret(mut self, secret: ApprovalSecret) -> Self {
        self.approval_secret = Some(secret);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<Canon> {
        let config = self.config;
        let provider = match self.provider {
            Some(p) => p,
            None => create_provider(&config.embedding)?,
        };
        let retry = self
            .retry
            .unwrap_or_else(|| RetryPolicy::from_config(&config.embedding));
        let gateway = EmbeddingGateway::new(provider, retry.clone());
        let reader = self
            .reader
            .unwrap_or_else(|| Arc::new(GitLogReader::new(config.drift.max_events)) as Arc<dyn ActivityReader>);
        let approval_secret = match self.approval_secret {
            Some(secret) => Some(secret),
            None => ApprovalSecret::from_env(&config.sacred.approval_secret_env).ok(),
        };

        let registry = Arc::new(ProjectRegistry::open(config.registry_db_path())?);
        tracing::info!(
            data_dir = %config.resolved_data_dir().display(),
            model = %gateway.identity().model,
            dimensions = gateway.dimensions(),
            "canon ready"
        );

        let mut knowledge =
            KnowledgeOrchestrator::new(config.clone(), Arc::clone(&registry), gateway.clone())?;
        if let Some(model) = self.language_model {
            knowledge = knowledge.with_language_model(model);
        }
        let approval_configured = approval_secret.is_some();
        let plans = Arc::new(SacredPlanStore::new(
            config.clone(),
            Arc::clone(&registry),
            gateway.clone(),
            approval_secret,
        ));
        let drift = DriftDetector::new(
            config.drift.clone(),
            Arc::clone(&registry),
            Arc::clone(&plans),
            gateway.clone(),
            reader,
            retry,
        );

        Ok(Canon {
            config: Arc::new(config),
            registry,
            knowledge: Arc::new(knowledge),
            plans,
            drift: Arc::new(drift),
            gateway,
            approval_configured,
        })
    }
}

#[derive(Clone)]
pub struct Canon {
    config: Arc<CanonConfig>,
    registry: Arc<ProjectRegistry>,
    knowledge: Arc<KnowledgeOrchestrator>,
    plans: Arc<SacredPlanStore>,
    drift: Arc<DriftDetector>,
    gateway: EmbeddingGateway,
    approval_configured: bool,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CanonError::internal(format!("blocking task failed: {e}")))?
}

impl Canon {
    pub fn builder(config: CanonConfig) -> CanonBuilder {
        CanonBuilder {
            config,
            provider: None,
            reader: None,
            language_model: None,
            approval_secret: None,
            retry: None,
        }
    }

    /// Open with every collaborator taken from configuration.
    pub fn open(config: CanonConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &CanonConfig {
        &self.config
    }

    // ── Projects ────────────────────────────────────────────────────────

    pub async fn create_project(
        &self,
        name: &str,
        root_path: &str,
        watch_paths: Vec<String>,
    ) -> Result<Project> {
        let registry = Arc::clone(&self.registry);
        let (name, root_path) = (name.to_string(), root_path.to_string());
        blocking(move || registry.create_project(&name, &root_path, &watch_paths)).await
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        let registry = Arc::clone(&self.registry);
        let id = id.to_string();
        blocking(move || registry.get_project(&id)).await
    }

    pub async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let registry = Arc::clone(&self.registry);
        let name = name.to_string();
        blocking(move || registry.find_project_by_name(&name)).await
    }

    pub async fn list_projects(&self, status: Option<ProjectStatus>) -> Result<Vec<Project>> {
        let registry = Arc::clone(&self.registry);
        blocking(move || registry.list_projects(status)).await
    }

    pub async fn focus_project(&self, id: &str) -> Result<Project> {
        let registry = Arc::clone(&self.registry);
        let id = id.to_string();
        blocking(move || registry.focus_project(&id)).await
    }

    pub async fn focused_project(&self) -> Result<Option<Project>> {
        let registry = Arc::clone(&self.registry);
        blocking(move || registry.focused_project()).await
    }

    pub async fn pause_project(&self, id: &str) -> Result<Project> {
        let registry = Arc::clone(&self.registry);
        let id = id.to_string();
        blocking(move || registry.pause_project(&id)).await
    }

    pub async fn resume_project(&self, id: &str) -> Result<Project> {
        let registry = Arc::clone(&self.registry);
        let id = id.to_string();
        blocking(move || registry.resume_project(&id)).await
    }

    pub async fn archive_project(&self, id: &str) -> Result<Project> {
        let registry = Arc::clone(&self.registry);
        let id = id.to_string();
        blocking(move || registry.archive_project(&id)).await
    }

    pub async fn unarchive_project(&self, id: &str) -> Result<Project> {
        let registry = Arc::clone(&self.registry);
        let id = id.to_string();
        blocking(move || registry.unarchive_project(&id)).await
    }

    pub async fn add_decision(
        &self,
        project_id: &str,
        title: &str,
        rationale: &str,
        author: Option<&str>,
    ) -> Result<Decision> {
        let registry = Arc::clone(&self.registry);
        let (project_id, title, rationale) =
            (project_id.to_string(), title.to_string(), rationale.to_string());
        let author = author.map(str::to_string);
        blocking(move || registry.add_decision(&project_id, &title, &rationale, author.as_deref()))
            .await
    }

    pub async fn list_decisions(&self, project_id: &str) -> Result<Vec<Decision>> {
        let registry = Arc::clone(&self.registry);
        let project_id = project_id.to_string();
        blocking(move || registry.list_decisions(&project_id)).await
    }

    pub async fn add_objective(
        &self,
        project_id: &str,
        title: &str,
        description: &str,
        priority: Priority,
    ) -> Result<Objective> {
        let registry = Arc::clone(&self.registry);
        let (project_id, title, description) =
            (project_id.to_string(), title.to_string(), description.to_string());
        blocking(move || registry.add_objective(&project_id, &title, &description, priority)).await
    }

    pub async fn list_objectives(&self, project_id: &str, pending_only: bool) -> Result<Vec<Objective>> {
        let registry = Arc::clone(&self.registry);
        let project_id = project_id.to_string();
        blocking(move || registry.list_objectives(&project_id, pending_only)).await
    }

    pub async fn complete_objective(&self, project_id: &str, objective_id: &str) -> Result<Objective> {
        let registry = Arc::clone(&self.registry);
        let (project_id, objective_id) = (project_id.to_string(), objective_id.to_string());
        blocking(move || registry.complete_objective(&project_id, &objective_id)).await
    }

    // ── Knowledge ───────────────────────────────────────────────────────

    /// Start a background ingest and return its handle. Project and root are
    /// checked before the job is queued.
    pub async fn ingest(&self, project_id: &str, root: Option<PathBuf>) -> Result<JobHandle> {
        let knowledge = Arc::clone(&self.knowledge);
        let pid = project_id.to_string();
        let root = blocking(move || knowledge.prepare_ingest(&pid, root.as_deref())).await?;
        if !root.is_dir() {
            return Err(CanonError::validation(format!(
                "ingest root {} is not a directory",
                root.display()
            )));
        }

        let (handle, cancel) = self.knowledge.jobs().create(project_id)?;
        let knowledge = Arc::clone(&self.knowledge);
        let job_id = handle.job_id.clone();
        let pid = project_id.to_string();
        tokio::task::spawn_blocking(move || {
            let jobs = knowledge.jobs();
            if let Err(e) = jobs.mark_running(&job_id) {
                tracing::error!(job_id = %job_id, error = %e, "failed to mark job running");
            }
            let progress = |p: &crate::knowledge::ingest::IngestProgress| {
                if let Err(e) = jobs.update_progress(&job_id, p) {
                    tracing::warn!(job_id = %job_id, error = %e, "progress update failed");
                }
            };
            let outcome = knowledge.ingest(&pid, Some(root.as_path()), &cancel, &progress);
            if let Err(e) = jobs.finish(&job_id, &outcome) {
                tracing::error!(job_id = %job_id, error = %e, "failed to record job outcome");
            }
        });

        tracing::info!(job_id = %handle.job_id, project_id = %project_id, "ingest job queued");
        Ok(handle)
    }

    /// Run an ingest in the foreground.
    pub async fn ingest_and_wait(&self, project_id: &str, root: Option<PathBuf>) -> Result<IngestSummary> {
        let knowledge = Arc::clone(&self.knowledge);
        let project_id = project_id.to_string();
        blocking(move || {
            knowledge.ingest(&project_id, root.as_deref(), &CancellationToken::new(), &|_| {})
        })
        .await
    }

    pub fn get_status(&self, job_id: &str) -> Result<JobStatus> {
        self.knowledge.jobs().status(job_id)
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<JobStatus> {
        self.knowledge.jobs().cancel(job_id)
    }

    pub fn list_jobs(&self, project_id: Option<&str>) -> Result<Vec<JobStatus>> {
        self.knowledge.jobs().list(project_id)
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait_for_job(&self, job_id: &str) -> Result<JobStatus> {
        loop {
            let status = self.get_status(job_id)?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let knowledge = Arc::clone(&self.knowledge);
        blocking(move || knowledge.query(&request)).await
    }

    pub async fn index_stats(&self, project_id: &str) -> Result<IndexStats> {
        let knowledge = Arc::clone(&self.knowledge);
        let project_id = project_id.to_string();
        blocking(move || knowledge.stats(&project_id)).await
    }

    // ── Sacred plans ────────────────────────────────────────────────────

    pub async fn create_sacred_plan(
        &self,
        project_id: &str,
        title: &str,
        body: &str,
        author: Option<&str>,
    ) -> Result<SubmitReceipt> {
        let plans = Arc::clone(&self.plans);
        let (project_id, title, body) = (project_id.to_string(), title.to_string(), body.to_string());
        let author = author.map(str::to_string);
        blocking(move || plans.create_sacred_plan(&project_id, &title, &body, author.as_deref())).await
    }

    pub async fn create_plan_draft(
        &self,
        project_id: &str,
        title: &str,
        body: &str,
        author: Option<&str>,
    ) -> Result<SacredPlan> {
        let plans = Arc::clone(&self.plans);
        let (project_id, title, body) = (project_id.to_string(), title.to_string(), body.to_string());
        let author = author.map(str::to_string);
        blocking(move || plans.create_draft(&project_id, &title, &body, author.as_deref())).await
    }

    pub async fn update_plan_draft(
        &self,
        plan_id: &str,
        title: &str,
        body: &str,
        author: Option<&str>,
    ) -> Result<SacredPlan> {
        let plans = Arc::clone(&self.plans);
        let (plan_id, title, body) = (plan_id.to_string(), title.to_string(), body.to_string());
        let author = author.map(str::to_string);
        blocking(move || plans.update_draft(&plan_id, &title, &body, author.as_deref())).await
    }

    pub async fn submit_plan(&self, plan_id: &str, author: Option<&str>) -> Result<SubmitReceipt> {
        let plans = Arc::clone(&self.plans);
        let plan_id = plan_id.to_string();
        let author = author.map(str::to_string);
        blocking(move || plans.submit(&plan_id, author.as_deref())).await
    }

    pub async fn propose_superseding_plan(
        &self,
        project_id: &str,
        supersedes: &str,
        title: &str,
        body: &str,
        author: Option<&str>,
    ) -> Result<SubmitReceipt> {
        let plans = Arc::clone(&self.plans);
        let (project_id, supersedes) = (project_id.to_string(), supersedes.to_string());
        let (title, body) = (title.to_string(), body.to_string());
        let author = author.map(str::to_string);
        blocking(move || {
            plans.propose_superseding_plan(&project_id, &supersedes, &title, &body, author.as_deref())
        })
        .await
    }

    pub async fn approve_sacred_plan(
        &self,
        plan_id: &str,
        verification_code: &str,
        secondary_secret: &str,
        approver: &str,
    ) -> Result<SacredPlan> {
        let plans = Arc::clone(&self.plans);
        let (plan_id, code) = (plan_id.to_string(), verification_code.to_string());
        let (secret, approver) = (secondary_secret.to_string(), approver.to_string());
        blocking(move || plans.approve(&plan_id, &code, &secret, &approver)).await
    }

    pub async fn lock_sacred_plan(&self, plan_id: &str, actor: Option<&str>) -> Result<SacredPlan> {
        let plans = Arc::clone(&self.plans);
        let plan_id = plan_id.to_string();
        let actor = actor.map(str::to_string);
        blocking(move || plans.lock(&plan_id, actor.as_deref())).await
    }

    pub async fn get_sacred_plan(&self, plan_id: &str) -> Result<SacredPlan> {
        let plans = Arc::clone(&self.plans);
        let plan_id = plan_id.to_string();
        blocking(move || plans.get(&plan_id)).await
    }

    pub async fn list_sacred_plans(
        &self,
        project_id: &str,
        status: Option<PlanStatus>,
    ) -> Result<Vec<SacredPlan>> {
        let plans = Arc::clone(&self.plans);
        let project_id = project_id.to_string();
        blocking(move || plans.list(&project_id, status)).await
    }

    pub async fn query_sacred_plans(&self, project_id: &str, question: &str, k: usize) -> Result<Vec<PlanHit>> {
        let plans = Arc::clone(&self.plans);
        let (project_id, question) = (project_id.to_string(), question.to_string());
        blocking(move || plans.query(&project_id, &question, k)).await
    }

    pub async fn plan_history(&self, plan_id: &str) -> Result<Vec<PlanLogEntry>> {
        let plans = Arc::clone(&self.plans);
        let plan_id = plan_id.to_string();
        blocking(move || plans.history(&plan_id)).await
    }

    // ── Drift & health ──────────────────────────────────────────────────

    pub async fn check_drift(&self, project_id: &str, hours: u32) -> Result<DriftReport> {
        let drift = Arc::clone(&self.drift);
        let project_id = project_id.to_string();
        blocking(move || drift.check_drift(&project_id, hours)).await
    }

    pub async fn health(&self) -> Result<HealthReport> {
        let registry = Arc::clone(&self.registry);
        let health = blocking(move || registry.health()).await?;
        let status = if health.database.integrity_ok { "ok" } else { "degraded" };
        Ok(HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            database: health.database,
            embedding: self.gateway.identity(),
            projects_active: health.active,
            projects_paused: health.paused,
            projects_archived: health.archived,
            approval_secret_configured: self.approval_configured,
        })
    }
}
