//! Sacred plan records and the approval secret.

use serde::Serialize;

use crate::error::{CanonError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    PendingApproval,
    Approved,
    /// Approved and hardened. Can still be superseded.
    Locked,
    /// Replaced by a newer plan. Body retained verbatim.
    Superseded,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Locked => "locked",
            Self::Superseded => "superseded",
        }
    }

    /// Title and body may only change while the plan is a draft.
    pub fn is_editable(&self) -> bool {
        matches!(self, Self::Draft)
    }

    /// Approved or locked: in force and used as a drift baseline.
    pub fn is_in_force(&self) -> bool {
        matches!(self, Self::Approved | Self::Locked)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "locked" => Ok(Self::Locked),
            "superseded" => Ok(Self::Superseded),
            _ => Err(format!("unknown plan status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SacredPlan {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub body: String,
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    pub segment_count: usize,
    pub created_at: String,
    pub updated_at: String,
}

/// Returned once, at submission. The store keeps only a hash of the code.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub plan_id: String,
    pub verification_code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanLogEntry {
    pub id: i64,
    pub plan_id: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub created_at: String,
}

/// A plan matched by a semantic query, with its best segment.
#[derive(Debug, Clone, Serialize)]
pub struct PlanHit {
    pub plan: SacredPlan,
    pub best_segment: String,
    pub score: f64,
}

/// Segment of an in-force plan, used as a drift baseline.
#[derive(Debug, Clone)]
pub struct PlanSegment {
    pub plan_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// The secondary approval secret. Never serialized, never printed.
#[derive(Clone)]
pub struct ApprovalSecret(String);

impl ApprovalSecret {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(CanonError::validation("approval secret must not be empty"));
        }
        Ok(Self(secret))
    }

    /// Read the secret from the named environment variable.
    pub fn from_env(var: &str) -> Result<Self> {
        match std::env::var(var) {
            Ok(value) => Self::new(value),
            Err(_) => Err(CanonError::validation(format!(
                "approval secret variable {var} is not set"
            ))),
        }
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApprovalSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApprovalSecret(***)")
    }
}
