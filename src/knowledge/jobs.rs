//! Background ingest job bookkeeping.
//!
//! Each job owns a [`CancellationToken`]. The registry only tracks state; the
//! caller decides where the work runs. Finished jobs stay visible for a
//! retention window and are evicted on the next `create` or `list` after it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::ingest::{IngestProgress, IngestSummary};
use crate::error::{CanonError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub job_id: String,
    pub project_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub project_id: String,
    pub state: JobState,
    pub files_total: usize,
    pub files_done: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<IngestSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

/// How long a terminal job stays queryable.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(60 * 60);

struct JobEntry {
    status: JobStatus,
    cancel: CancellationToken,
    finished: Option<Instant>,
}

pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobEntry>>,
    retention: Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, JobEntry>>> {
        self.jobs
            .lock()
            .map_err(|e| CanonError::internal(format!("job registry lock poisoned: {e}")))
    }

    /// Drop terminal jobs whose retention window has passed.
    fn evict_expired(&self, jobs: &mut HashMap<String, JobEntry>) {
        let before = jobs.len();
        jobs.retain(|_, entry| {
            entry
                .finished
                .map_or(true, |at| at.elapsed() < self.retention)
        });
        let evicted = before - jobs.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted finished ingest jobs");
        }
    }

    /// Register a queued job and hand back its token.
    pub fn create(&self, project_id: &str) -> Result<(JobHandle, CancellationToken)> {
        let job_id = uuid::Uuid::now_v7().to_string();
        let cancel = CancellationToken::new();
        let status = JobStatus {
            job_id: job_id.clone(),
            project_id: project_id.to_string(),
            state: JobState::Queued,
            files_total: 0,
            files_done: 0,
            current_path: None,
            summary: None,
            error: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            started_at: None,
            finished_at: None,
        };
        let mut jobs = self.lock()?;
        self.evict_expired(&mut jobs);
        jobs.insert(
            job_id.clone(),
            JobEntry {
                status,
                cancel: cancel.clone(),
                finished: None,
            },
        );
        Ok((
            JobHandle {
                job_id,
                project_id: project_id.to_string(),
            },
            cancel,
        ))
    }

    pub fn mark_running(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.lock()?;
        if let Some(entry) = jobs.get_mut(job_id) {
            if entry.status.state == JobState::Queued {
                entry.status.state = JobState::Running;
                entry.status.started_at = Some(chrono::Utc::now().to_rfc3339());
            }
        }
        Ok(())
    }

    pub fn update_progress(&self, job_id: &str, progress: &IngestProgress) -> Result<()> {
        let mut jobs = self.lock()?;
        if let Some(entry) = jobs.get_mut(job_id) {
            entry.status.files_total = progress.files_total;
            entry.status.files_done = progress.files_done;
            entry.status.current_path = progress.current_path.clone();
        }
        Ok(())
    }

    /// Record the outcome. A summary flagged as cancelled ends in `Cancelled`.
    pub fn finish(&self, job_id: &str, outcome: &Result<IngestSummary>) -> Result<()> {
        let mut jobs = self.lock()?;
        let Some(entry) = jobs.get_mut(job_id) else {
            return Ok(());
        };
        entry.finished = Some(Instant::now());
        let status = &mut entry.status;
        status.finished_at = Some(chrono::Utc::now().to_rfc3339());
        status.current_path = None;
        match outcome {
            Ok(summary) => {
                status.state = if summary.cancelled {
                    JobState::Cancelled
                } else {
                    JobState::Completed
                };
                status.summary = Some(summary.clone());
            }
            Err(e) => {
                status.state = JobState::Failed;
                status.error = Some(e.to_string());
            }
        }
        tracing::info!(job_id = %job_id, state = ?status.state, "ingest job finished");
        Ok(())
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatus> {
        self.lock()?
            .get(job_id)
            .map(|e| e.status.clone())
            .ok_or_else(|| CanonError::not_found("job", job_id))
    }

    /// Request cancellation. The running ingest stops before its next file or
    /// batch; already-committed batches stay. Terminal jobs are left as they are.
    pub fn cancel(&self, job_id: &str) -> Result<JobStatus> {
        let jobs = self.lock()?;
        let entry = jobs
            .get(job_id)
            .ok_or_else(|| CanonError::not_found("job", job_id))?;
        if !entry.status.state.is_terminal() {
            entry.cancel.cancel();
            tracing::info!(job_id = %job_id, "ingest job cancellation requested");
        }
        Ok(entry.status.clone())
    }

    pub fn list(&self, project_id: Option<&str>) -> Result<Vec<JobStatus>> {
        let mut jobs = self.lock()?;
        self.evict_expired(&mut jobs);
        let mut out: Vec<JobStatus> = jobs
            .values()
            .filter(|e| project_id.map_or(true, |p| e.status.project_id == p))
            .map(|e| e.status.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.job_id.cmp(&b.job_id)));
        Ok(out)
    }
}
