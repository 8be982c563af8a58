//! Sacred plan store: approved, immutable architecture documents kept in a
//! per-project `sacred.db`, physically apart from project knowledge.
//!
//! Lifecycle: draft → pending_approval → approved → locked, with superseded
//! reachable from approved or locked once a successor is approved. Approval
//! needs both the verification code issued at submission and the secondary
//! secret; both are checked before anything is written. Approval, lock and
//! submission are serialized per plan id.

pub mod collection;
pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::config::CanonConfig;
use crate::db::{self, DbKind};
use crate::embedding::{l2_distance_to_cosine, EmbeddingGateway};
use crate::error::{CanonError, Result};
use crate::knowledge::index::sha256_hex;
use crate::registry::types::ProjectStatus;
use crate::registry::ProjectRegistry;
use crate::segment::{segment, SegmentCandidate, SegmentKind, SegmentOptions};

use types::{ApprovalSecret, PlanHit, PlanLogEntry, PlanSegment, PlanStatus, SacredPlan, SubmitReceipt};

/// Unambiguous upper-case alphabet for verification codes.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

type Collection = Arc<Mutex<Connection>>;

pub struct SacredPlanStore {
    config: CanonConfig,
    registry: Arc<ProjectRegistry>,
    gateway: EmbeddingGateway,
    segment_options: SegmentOptions,
    approval_secret: Option<ApprovalSecret>,
    collections: Mutex<HashMap<String, Collection>>,
    plan_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Plan id: first 32 hex chars of sha256(project ‖ title ‖ body ‖ supersedes).
pub fn plan_id(project_id: &str, title: &str, body: &str, supersedes: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    for part in [project_id, title, body, supersedes.unwrap_or("")] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(32);
    hex
}

/// Equal-length byte comparison whose run time does not depend on where the
/// inputs differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn generate_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn lock_err<T>(what: &'static str) -> impl Fn(PoisonError<T>) -> CanonError {
    move |e| CanonError::internal(format!("{what} lock poisoned: {e}"))
}

impl SacredPlanStore {
    pub fn new(
        config: CanonConfig,
        registry: Arc<ProjectRegistry>,
        gateway: EmbeddingGateway,
        approval_secret: Option<ApprovalSecret>,
    ) -> Self {
        if approval_secret.is_none() {
            tracing::warn!(
                env = %config.sacred.approval_secret_env,
                "no approval secret configured, plans cannot be approved"
            );
        }
        Self {
            segment_options: SegmentOptions::from(&config.chunking),
            config,
            registry,
            gateway,
            approval_secret,
            collections: Mutex::new(HashMap::new()),
            plan_locks: Mutex::new(HashMap::new()),
        }
    }

    fn collection(&self, project_id: &str) -> Result<Collection> {
        let mut collections = self.collections.lock().map_err(lock_err("sacred collection cache"))?;
        if let Some(conn) = collections.get(project_id) {
            return Ok(Arc::clone(conn));
        }
        let path = self.config.project_dir(project_id).join("sacred.db");
        let conn = db::open_index_database(&path, DbKind::Sacred, &self.gateway.identity())?;
        let conn = Arc::new(Mutex::new(conn));
        collections.insert(project_id.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Run `f` holding the plan's mutex. The table entry is dropped once no
    /// other caller holds or waits on it.
    fn with_plan_lock<T>(&self, plan_id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = {
            let mut locks = self.plan_locks.lock().map_err(lock_err("plan lock table"))?;
            Arc::clone(locks.entry(plan_id.to_string()).or_default())
        };
        let outcome = match lock.lock() {
            Ok(_guard) => f(),
            Err(e) => Err(lock_err("plan")(e)),
        };

        let mut locks = self.plan_locks.lock().map_err(lock_err("plan lock table"))?;
        // One reference in the table, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(plan_id);
        }
        outcome
    }

    #[cfg(test)]
    fn plan_lock_entries(&self) -> usize {
        self.plan_locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    /// Owning project and collection of a plan.
    fn locate(&self, plan_id: &str) -> Result<(String, Collection)> {
        let project_id = self.registry.plan_owner(plan_id)?;
        let sacred = self.collection(&project_id)?;
        Ok((project_id, sacred))
    }

    fn writable_project(&self, project_id: &str) -> Result<()> {
        let project = self.registry.get_project(project_id)?;
        if project.status == ProjectStatus::Archived {
            return Err(CanonError::validation(format!(
                "project {} is archived",
                project.name
            )));
        }
        Ok(())
    }

    fn embed_body(&self, body: &str) -> Result<(Vec<SegmentCandidate>, Vec<Vec<f32>>)> {
        let segments = segment(body, SegmentKind::Document, &self.segment_options);
        let texts: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
        let embeddings = self.gateway.embed_batch(&texts)?;
        Ok((segments, embeddings))
    }

    fn insert_draft(
        &self,
        project_id: &str,
        title: &str,
        body: &str,
        supersedes: Option<&str>,
        author: Option<&str>,
    ) -> Result<SacredPlan> {
        let title = title.trim();
        if title.is_empty() {
            return Err(CanonError::validation("plan title must not be empty"));
        }
        if body.trim().is_empty() {
            return Err(CanonError::validation("plan body must not be empty"));
        }
        self.writable_project(project_id)?;

        let id = plan_id(project_id, title, body, supersedes);
        let (segments, embeddings) = self.embed_body(body)?;

        self.registry.register_plan(&id, project_id)?;
        let sacred = self.collection(project_id)?;
        let mut conn = sacred.lock().map_err(lock_err("sacred collection"))?;
        if collection::find_plan(&conn, &id)?.is_some() {
            return Err(CanonError::consistency(format!(
                "an identical plan already exists: {id}"
            )));
        }

        let now = chrono::Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        collection::insert_plan(&tx, &id, project_id, title, body, supersedes, &now)?;
        collection::replace_segments(&tx, &id, &segments, &embeddings)?;
        let details = supersedes.map(|old| serde_json::json!({ "supersedes": old }));
        collection::write_log(&tx, &id, "create", author, details.as_ref(), &now)?;
        tx.commit()?;

        tracing::info!(project_id = %project_id, plan_id = %id, segments = segments.len(), "sacred plan drafted");
        collection::load_plan(&conn, &id)
    }

    pub fn create_draft(
        &self,
        project_id: &str,
        title: &str,
        body: &str,
        author: Option<&str>,
    ) -> Result<SacredPlan> {
        self.insert_draft(project_id, title, body, None, author)
    }

    /// Replace title and body of a draft. The id stays what it was at creation.
    pub fn update_draft(
        &self,
        plan_id: &str,
        title: &str,
        body: &str,
        author: Option<&str>,
    ) -> Result<SacredPlan> {
        let title = title.trim();
        if title.is_empty() || body.trim().is_empty() {
            return Err(CanonError::validation("plan title and body must not be empty"));
        }
        self.with_plan_lock(plan_id, || {
            let (_, sacred) = self.locate(plan_id)?;

            let current = {
                let conn = sacred.lock().map_err(lock_err("sacred collection"))?;
                collection::load_plan(&conn, plan_id)?
            };
            if !current.status.is_editable() {
                return Err(CanonError::consistency(format!(
                    "plan {plan_id} is {}; its content is immutable",
                    current.status
                )));
            }

            let (segments, embeddings) = self.embed_body(body)?;
            let mut conn = sacred.lock().map_err(lock_err("sacred collection"))?;
            let now = chrono::Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            collection::update_content(&tx, plan_id, title, body, &now)?;
            collection::replace_segments(&tx, plan_id, &segments, &embeddings)?;
            collection::write_log(&tx, plan_id, "edit", author, None, &now)?;
            tx.commit()?;

            tracing::info!(plan_id = %plan_id, "sacred plan draft edited");
            collection::load_plan(&conn, plan_id)
        })
    }

    /// Move a draft to pending approval and issue its verification code.
    pub fn submit(&self, plan_id: &str, author: Option<&str>) -> Result<SubmitReceipt> {
        self.with_plan_lock(plan_id, || {
            let (_, sacred) = self.locate(plan_id)?;
            let mut conn = sacred.lock().map_err(lock_err("sacred collection"))?;

            let plan = collection::load_plan(&conn, plan_id)?;
            if plan.status != PlanStatus::Draft {
                return Err(CanonError::consistency(format!(
                    "only drafts can be submitted; plan {plan_id} is {}",
                    plan.status
                )));
            }

            let code = generate_code(self.config.sacred.verification_code_length);
            let now = chrono::Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            collection::transition(&tx, plan_id, PlanStatus::Draft, PlanStatus::PendingApproval, &now)?;
            collection::set_verification_hash(&tx, plan_id, &sha256_hex(code.as_bytes()))?;
            collection::write_log(&tx, plan_id, "submit", author, None, &now)?;
            tx.commit()?;

            tracing::info!(plan_id = %plan_id, "sacred plan submitted for approval");
            Ok(SubmitReceipt {
                plan_id: plan_id.to_string(),
                verification_code: code,
            })
        })
    }

    /// Draft and submit in one step.
    pub fn create_sacred_plan(
        &self,
        project_id: &str,
        title: &str,
        body: &str,
        author: Option<&str>,
    ) -> Result<SubmitReceipt> {
        let plan = self.insert_draft(project_id, title, body, None, author)?;
        self.submit(&plan.id, author)
    }

    /// Draft and submit a plan that replaces an approved or locked one.
    /// The old plan turns superseded only when the new one is approved.
    pub fn propose_superseding_plan(
        &self,
        project_id: &str,
        supersedes: &str,
        title: &str,
        body: &str,
        author: Option<&str>,
    ) -> Result<SubmitReceipt> {
        let target = self.get(supersedes)?;
        if target.project_id != project_id {
            return Err(CanonError::consistency(format!(
                "plan {supersedes} belongs to another project"
            )));
        }
        if !target.status.is_in_force() {
            return Err(CanonError::consistency(format!(
                "only approved or locked plans can be superseded; plan {supersedes} is {}",
                target.status
            )));
        }
        let plan = self.insert_draft(project_id, title, body, Some(supersedes), author)?;
        self.submit(&plan.id, author)
    }

    /// Two-phase approval: the verification code and the secondary secret are
    /// both compared before any write. A mismatch leaves the plan pending and
    /// writes a `reject` audit row.
    pub fn approve(
        &self,
        plan_id: &str,
        verification_code: &str,
        secondary_secret: &str,
        approver: &str,
    ) -> Result<SacredPlan> {
        let approver = approver.trim();
        if approver.is_empty() {
            return Err(CanonError::validation("approver must not be empty"));
        }

        self.with_plan_lock(plan_id, || {
            let (project_id, sacred) = self.locate(plan_id)?;
            let mut conn = sacred.lock().map_err(lock_err("sacred collection"))?;

            let plan = collection::load_plan(&conn, plan_id)?;
            if plan.status != PlanStatus::PendingApproval {
                return Err(CanonError::consistency(format!(
                    "plan {plan_id} is {}; only pending plans can be approved",
                    plan.status
                )));
            }

            let presented = sha256_hex(verification_code.trim().to_ascii_uppercase().as_bytes());
            let stored = collection::verification_hash(&conn, plan_id)?.unwrap_or_default();
            let code_ok = constant_time_eq(presented.as_bytes(), stored.as_bytes());
            let secret_ok = match &self.approval_secret {
                Some(secret) => constant_time_eq(
                    &Sha256::digest(secondary_secret.as_bytes()),
                    &Sha256::digest(secret.expose().as_bytes()),
                ),
                None => false,
            };

            let now = chrono::Utc::now().to_rfc3339();
            if !(code_ok && secret_ok) {
                collection::write_log(
                    &conn,
                    plan_id,
                    "reject",
                    Some(approver),
                    Some(&serde_json::json!({ "reason": "credential mismatch" })),
                    &now,
                )?;
                tracing::warn!(plan_id = %plan_id, approver = %approver, "sacred plan approval rejected");
                return Err(CanonError::Authorization(
                    "verification code or approval secret did not match".into(),
                ));
            }

            let tx = conn.transaction()?;
            collection::record_approval(&tx, plan_id, approver, &now)?;
            collection::write_log(&tx, plan_id, "approve", Some(approver), None, &now)?;
            if let Some(old) = plan.supersedes.as_deref() {
                if !collection::mark_superseded(&tx, old, plan_id, &now)? {
                    // Dropping the transaction rolls the approval back.
                    return Err(CanonError::consistency(format!(
                        "plan {old} is no longer in force and cannot be superseded"
                    )));
                }
                let details = serde_json::json!({ "superseded_by": plan_id });
                collection::write_log(&tx, old, "supersede", Some(approver), Some(&details), &now)?;
            }
            tx.commit()?;

            tracing::info!(project_id = %project_id, plan_id = %plan_id, approver = %approver, "sacred plan approved");
            collection::load_plan(&conn, plan_id)
        })
    }

    pub fn lock(&self, plan_id: &str, actor: Option<&str>) -> Result<SacredPlan> {
        self.with_plan_lock(plan_id, || {
            let (_, sacred) = self.locate(plan_id)?;
            let mut conn = sacred.lock().map_err(lock_err("sacred collection"))?;

            let now = chrono::Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            if !collection::record_lock(&tx, plan_id, &now)? {
                let plan = collection::load_plan(&tx, plan_id)?;
                return Err(CanonError::consistency(format!(
                    "only approved plans can be locked; plan {plan_id} is {}",
                    plan.status
                )));
            }
            collection::write_log(&tx, plan_id, "lock", actor, None, &now)?;
            tx.commit()?;

            tracing::info!(plan_id = %plan_id, "sacred plan locked");
            collection::load_plan(&conn, plan_id)
        })
    }

    pub fn get(&self, plan_id: &str) -> Result<SacredPlan> {
        let (_, sacred) = self.locate(plan_id)?;
        let conn = sacred.lock().map_err(lock_err("sacred collection"))?;
        collection::load_plan(&conn, plan_id)
    }

    pub fn list(&self, project_id: &str, status: Option<PlanStatus>) -> Result<Vec<SacredPlan>> {
        self.registry.get_project(project_id)?;
        let sacred = self.collection(project_id)?;
        let conn = sacred.lock().map_err(lock_err("sacred collection"))?;
        collection::list_plans(&conn, status)
    }

    /// Semantic search over one project's plans; each plan appears once with
    /// its best-matching segment.
    pub fn query(&self, project_id: &str, question: &str, k: usize) -> Result<Vec<PlanHit>> {
        if question.trim().is_empty() {
            return Err(CanonError::validation("question must not be empty"));
        }
        if k == 0 {
            return Err(CanonError::validation("k must be at least 1"));
        }
        self.registry.get_project(project_id)?;
        let k = k.min(self.config.retrieval.max_k);
        let embedding = self.gateway.embed(question)?;

        let sacred = self.collection(project_id)?;
        let conn = sacred.lock().map_err(lock_err("sacred collection"))?;
        let rows = collection::search_segments(&conn, &embedding, k * 4)?;

        let mut best: Vec<(String, String, f64)> = Vec::new();
        for (plan_id, text, distance) in rows {
            let score = l2_distance_to_cosine(distance);
            match best.iter_mut().find(|(id, _, _)| *id == plan_id) {
                Some(entry) if entry.2 < score => *entry = (plan_id, text, score),
                Some(_) => {}
                None => best.push((plan_id, text, score)),
            }
        }
        best.sort_by(|a, b| b.2.total_cmp(&a.2));
        best.truncate(k);

        best.into_iter()
            .map(|(plan_id, best_segment, score)| {
                Ok(PlanHit {
                    plan: collection::load_plan(&conn, &plan_id)?,
                    best_segment,
                    score,
                })
            })
            .collect()
    }

    pub fn history(&self, plan_id: &str) -> Result<Vec<PlanLogEntry>> {
        let (_, sacred) = self.locate(plan_id)?;
        let conn = sacred.lock().map_err(lock_err("sacred collection"))?;
        collection::read_log(&conn, plan_id)
    }

    /// Approved and locked plans of a project with their segment vectors.
    pub fn in_force(&self, project_id: &str) -> Result<(Vec<SacredPlan>, Vec<PlanSegment>)> {
        self.registry.get_project(project_id)?;
        let sacred = self.collection(project_id)?;
        let conn = sacred.lock().map_err(lock_err("sacred collection"))?;
        let plans = collection::list_plans(&conn, None)?
            .into_iter()
            .filter(|p| p.status.is_in_force())
            .collect();
        let segments = collection::in_force_segments(&conn)?;
        Ok((plans, segments))
    }
}
