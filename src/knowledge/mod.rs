//! Knowledge orchestration: filter → segmenter → embedding gateway → project
//! index on the way in, and project-scoped retrieval on the way out.
//!
//! Each project gets its own `projects/<id>/knowledge.db`. Handles are opened
//! lazily and cached; nothing here ever reads across two projects.

pub mod index;
pub mod ingest;
pub mod jobs;
pub mod query;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::config::CanonConfig;
use crate::embedding::EmbeddingGateway;
use crate::error::{CanonError, Result};
use crate::filter::{PathFilter, Redactor};
use crate::llm::{build_grounded_prompt, LanguageModel};
use crate::registry::types::ProjectStatus;
use crate::registry::ProjectRegistry;
use crate::retry::RetryPolicy;
use crate::segment::SegmentOptions;

use index::{IndexStats, ProjectIndex};
use ingest::{run_ingest, IngestPipeline, IngestProgress, IngestSummary};
use jobs::JobRegistry;
use query::{search_project, QueryRequest, QueryResponse};

pub struct KnowledgeOrchestrator {
    config: CanonConfig,
    registry: Arc<ProjectRegistry>,
    gateway: EmbeddingGateway,
    pipeline: IngestPipeline,
    language_model: Option<Arc<dyn LanguageModel>>,
    llm_retry: RetryPolicy,
    indexes: Mutex<HashMap<String, Arc<ProjectIndex>>>,
    jobs: JobRegistry,
}

impl KnowledgeOrchestrator {
    pub fn new(
        config: CanonConfig,
        registry: Arc<ProjectRegistry>,
        gateway: EmbeddingGateway,
    ) -> Result<Self> {
        let pipeline = IngestPipeline {
            filter: PathFilter::from_config(&config.filter),
            redactor: Redactor::from_config(&config.filter)?,
            segment_options: SegmentOptions::from(&config.chunking),
            gateway: gateway.clone(),
            batch_size: config.embedding.batch_size,
        };
        Ok(Self {
            llm_retry: RetryPolicy::from_config(&config.embedding),
            config,
            registry,
            gateway,
            pipeline,
            language_model: None,
            indexes: Mutex::new(HashMap::new()),
            jobs: JobRegistry::new(),
        })
    }

    /// Attach the capability used for answer synthesis.
    pub fn with_language_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.language_model = Some(model);
        self
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    /// Open (or reuse) the index of one project.
    pub fn index_for(&self, project_id: &str) -> Result<Arc<ProjectIndex>> {
        let mut indexes = self
            .indexes
            .lock()
            .map_err(|e| CanonError::internal(format!("index cache lock poisoned: {e}")))?;
        if let Some(index) = indexes.get(project_id) {
            return Ok(Arc::clone(index));
        }
        let path = self.config.project_dir(project_id).join("knowledge.db");
        let index = Arc::new(ProjectIndex::open(
            project_id,
            &path,
            &self.gateway.identity(),
        )?);
        tracing::debug!(project_id = %project_id, path = %path.display(), "opened project index");
        indexes.insert(project_id.to_string(), Arc::clone(&index));
        Ok(index)
    }

    /// Resolve the target of an ingest run. Archived projects are read-only.
    pub fn prepare_ingest(&self, project_id: &str, root: Option<&Path>) -> Result<PathBuf> {
        let project = self.registry.get_project(project_id)?;
        if project.status == ProjectStatus::Archived {
            return Err(CanonError::validation(format!(
                "project {} is archived; unarchive it before ingesting",
                project.name
            )));
        }
        Ok(root
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&project.root_path)))
    }

    /// Run one ingest to completion on the current thread.
    pub fn ingest(
        &self,
        project_id: &str,
        root: Option<&Path>,
        cancel: &CancellationToken,
        progress: &dyn Fn(&IngestProgress),
    ) -> Result<IngestSummary> {
        let root = self.prepare_ingest(project_id, root)?;
        let index = self.index_for(project_id)?;
        let summary = run_ingest(&self.pipeline, &index, &root, cancel, progress)?;
        self.registry.touch_project(project_id)?;
        Ok(summary)
    }

    /// Answer a question from one project's index only.
    ///
    /// A missing project id is a validation error and an unknown one is
    /// not-found; neither falls back to a wider search. Synthesis failures
    /// degrade to ranked segments with `synthesis_error` set.
    pub fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let (project_id, k) = request.validate(
            self.config.retrieval.default_k,
            self.config.retrieval.max_k,
        )?;
        // Unknown ids stop here, before any index is opened.
        self.registry.get_project(&project_id)?;

        let index = self.index_for(&project_id)?;
        let embedding = self.gateway.embed(&request.question)?;
        let results = search_project(&index, &embedding, k)?;
        self.registry.touch_project(&project_id)?;

        tracing::debug!(project_id = %project_id, k, hits = results.len(), "query served");

        let mut response = QueryResponse {
            project_id,
            question: request.question.clone(),
            results,
            answer: None,
            synthesis_error: None,
        };
        if request.synthesize {
            match self.synthesize(&request.question, &response) {
                Ok(answer) => response.answer = Some(answer),
                Err(e) => {
                    tracing::warn!(project_id = %response.project_id, error = %e, "synthesis failed, returning raw segments");
                    response.synthesis_error = Some(e.to_string());
                }
            }
        }
        Ok(response)
    }

    fn synthesize(&self, question: &str, response: &QueryResponse) -> Result<String> {
        let model = self.language_model.as_ref().ok_or_else(|| CanonError::ExternalService {
            service: "llm",
            attempts: 0,
            message: "no language model configured".into(),
        })?;
        if response.results.is_empty() {
            return Err(CanonError::validation("no segments to ground an answer in"));
        }
        let prompt = build_grounded_prompt(
            question,
            &response.results,
            self.config.retrieval.synthesis_context_chars,
        );
        self.llm_retry.run("llm", || model.complete(&prompt))
    }

    pub fn stats(&self, project_id: &str) -> Result<IndexStats> {
        self.registry.get_project(project_id)?;
        self.index_for(project_id)?.stats()
    }
}
