//! Drift detection: compare recent activity with the plans in force.
//!
//! Read-only. Reports are computed on demand and never stored, so concurrent
//! checks and checks during ingestion are safe.

pub mod report;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::activity::ActivityReader;
use crate::config::DriftConfig;
use crate::embedding::{cosine_similarity, EmbeddingGateway};
use crate::error::{CanonError, Result};
use crate::registry::types::Priority;
use crate::registry::ProjectRegistry;
use crate::retry::RetryPolicy;
use crate::sacred::SacredPlanStore;

use report::{aggregate, recommend, DriftReport, DriftStatus, Recommendation, ScoredEvent};

/// Longest window accepted by [`DriftDetector::check_drift`]: one year.
pub const MAX_WINDOW_HOURS: u32 = 8760;

pub struct DriftDetector {
    config: DriftConfig,
    registry: Arc<ProjectRegistry>,
    plans: Arc<SacredPlanStore>,
    gateway: EmbeddingGateway,
    reader: Arc<dyn ActivityReader>,
    retry: RetryPolicy,
}

impl DriftDetector {
    pub fn new(
        config: DriftConfig,
        registry: Arc<ProjectRegistry>,
        plans: Arc<SacredPlanStore>,
        gateway: EmbeddingGateway,
        reader: Arc<dyn ActivityReader>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            registry,
            plans,
            gateway,
            reader,
            retry,
        }
    }

    pub fn check_drift(&self, project_id: &str, hours: u32) -> Result<DriftReport> {
        self.check_drift_at(project_id, hours, Utc::now())
    }

    /// Drift over `(now - hours, now]`.
    pub fn check_drift_at(
        &self,
        project_id: &str,
        hours: u32,
        now: DateTime<Utc>,
    ) -> Result<DriftReport> {
        if hours == 0 || hours > MAX_WINDOW_HOURS {
            return Err(CanonError::validation(format!(
                "window must be between 1 and {MAX_WINDOW_HOURS} hours, got {hours}"
            )));
        }
        let project = self.registry.get_project(project_id)?;
        let since = now - Duration::hours(i64::from(hours));

        let root = Path::new(&project.root_path);
        let mut events = self
            .retry
            .run("activity", || self.reader.read(root, since, now))?;
        events.truncate(self.config.max_events);

        let mut report = DriftReport {
            project_id: project.id.clone(),
            window_hours: hours,
            alignment_score: 1.0,
            status: DriftStatus::Aligned,
            plan_scores: Vec::new(),
            recommendations: Vec::new(),
            events_analyzed: events.len(),
            note: None,
            generated_at: now.to_rfc3339(),
        };

        if events.is_empty() {
            report.note = Some("no activity in the window; nothing contradicts the plans".into());
            tracing::info!(project_id = %project.id, hours, "drift check: no activity");
            return Ok(report);
        }

        let (plans, segments) = self.plans.in_force(&project.id)?;
        if plans.is_empty() {
            // Nothing in force can account for the activity.
            report.alignment_score = 0.0;
            report.status = DriftStatus::CriticalViolation;
            report.note = Some("no approved plans to compare against".into());
            report.recommendations.push(Recommendation {
                priority: Priority::High,
                message: "approve a sacred plan so recent activity can be checked for drift".into(),
                plan_id: None,
                files: Vec::new(),
            });
            tracing::info!(project_id = %project.id, events = events.len(), "drift check: no plans in force");
            return Ok(report);
        }

        let summaries: Vec<String> = events.iter().map(|e| e.summary()).collect();
        let texts: Vec<&str> = summaries.iter().map(String::as_str).collect();
        let embeddings = self.gateway.embed_batch(&texts)?;

        let scored: Vec<ScoredEvent> = events
            .iter()
            .zip(&embeddings)
            .map(|(event, embedding)| {
                let similarity = plans
                    .iter()
                    .map(|plan| {
                        segments
                            .iter()
                            .filter(|s| s.plan_id == plan.id)
                            .map(|s| cosine_similarity(embedding, &s.embedding).clamp(0.0, 1.0))
                            .fold(0.0, f64::max)
                    })
                    .collect();
                ScoredEvent {
                    commit_id: event.commit_id.clone(),
                    changed_files: event.changed_files.clone(),
                    age_hours: (now - event.timestamp).num_seconds().max(0) as f64 / 3600.0,
                    similarity,
                }
            })
            .collect();

        let (overall, plan_scores) =
            aggregate(&plans, &scored, self.config.recency_half_life_hours);
        report.alignment_score = overall;
        report.status = DriftStatus::from_score(overall);
        report.recommendations = recommend(&scored, &plan_scores, self.config.unrelated_threshold);
        report.plan_scores = plan_scores;

        tracing::info!(
            project_id = %project.id,
            hours,
            events = report.events_analyzed,
            plans = plans.len(),
            score = report.alignment_score,
            status = %report.status,
            "drift check complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityEvent, StaticActivityReader};
    use crate::config::CanonConfig;
    use crate::embedding::create_provider;
    use crate::sacred::types::ApprovalSecret;

    fn detector(events: Vec<ActivityEvent>) -> (tempfile::TempDir, DriftDetector, Arc<SacredPlanStore>, String) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CanonConfig::with_data_dir(dir.path());
        config.embedding.dimensions = 64;
        let registry = Arc::new(ProjectRegistry::open(config.registry_db_path()).unwrap());
        let project = registry.create_project("demo", "/tmp/demo", &[]).unwrap();
        let gateway = EmbeddingGateway::new(
            create_provider(&config.embedding).unwrap(),
            RetryPolicy::immediate(1),
        );
        let plans = Arc::new(SacredPlanStore::new(
            config.clone(),
            Arc::clone(&registry),
            gateway.clone(),
            Some(ApprovalSecret::new("s").unwrap()),
        ));
        let detector = DriftDetector::new(
            config.drift.clone(),
            registry,
            Arc::clone(&plans),
            gateway,
            Arc::new(StaticActivityReader::new(events)),
            RetryPolicy::immediate(1),
        );
        (dir, detector, plans, project.id)
    }

    #[test]
    fn window_is_validated() {
        let (_dir, detector, _, project) = detector(vec![]);
        assert_eq!(detector.check_drift(&project, 0).unwrap_err().kind(), "validation_error");
        assert_eq!(
            detector.check_drift(&project, MAX_WINDOW_HOURS + 1).unwrap_err().kind(),
            "validation_error"
        );
        assert_eq!(detector.check_drift("nope", 24).unwrap_err().kind(), "not_found_error");
    }

    #[test]
    fn activity_without_plans_recommends_approval() {
        let event = ActivityEvent {
            commit_id: "c1".into(),
            changed_files: vec!["src/x.rs".into()],
            branch: "main".into(),
            timestamp: Utc::now(),
            message: "refactor".into(),
        };
        let (_dir, detector, _, project) = detector(vec![event]);
        let report = detector.check_drift(&project, 24).unwrap();
        assert_eq!(report.status, DriftStatus::CriticalViolation);
        assert_eq!(report.alignment_score, 0.0);
        assert_eq!(report.events_analyzed, 1);
        assert_eq!(report.recommendations[0].priority, Priority::High);
    }

    #[test]
    fn events_outside_window_are_ignored() {
        let event = ActivityEvent {
            commit_id: "old".into(),
            changed_files: vec![],
            branch: "main".into(),
            timestamp: Utc::now() - Duration::hours(100),
            message: "ancient".into(),
        };
        let (_dir, detector, plans, project) = detector(vec![event]);
        let receipt = plans.create_sacred_plan(&project, "T", "Body text", None).unwrap();
        plans.approve(&receipt.plan_id, &receipt.verification_code, "s", "lead").unwrap();
        let report = detector.check_drift(&project, 24).unwrap();
        assert_eq!(report.events_analyzed, 0);
        assert_eq!(report.status, DriftStatus::Aligned);
    }
}
