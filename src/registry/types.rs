//! Project registry records.
//!
//! [`Project`] with its [`ProjectStatus`] lifecycle, plus the append-only
//! [`Decision`] log and forward-only [`Objective`] list attached to each project.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Paused,
    /// Soft-deleted. Data is retained and still queryable, but not ingested into.
    Archived,
}

impl ProjectStatus {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
        }
    }

    /// Whether `self → to` is a legal lifecycle step. Same-state requests are
    /// handled by the caller as no-ops.
    pub fn can_transition_to(&self, to: ProjectStatus) -> bool {
        matches!(
            (self, to),
            (Self::Active, Self::Paused)
                | (Self::Paused, Self::Active)
                | (Self::Active, Self::Archived)
                | (Self::Paused, Self::Archived)
                | (Self::Archived, Self::Active)
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("unknown project status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root_path: String,
    pub status: ProjectStatus,
    /// At most one project in the registry is focused.
    pub focused: bool,
    pub watch_paths: Vec<String>,
    pub created_at: String,
    pub last_active_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("unknown priority: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Objective {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    /// Set only forward: once true it never returns to false.
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        use ProjectStatus::*;
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Archived));
        assert!(Paused.can_transition_to(Archived));
        assert!(Archived.can_transition_to(Active));
        assert!(!Archived.can_transition_to(Paused));
    }

    #[test]
    fn status_roundtrip() {
        for s in [ProjectStatus::Active, ProjectStatus::Paused, ProjectStatus::Archived] {
            assert_eq!(s.as_str().parse::<ProjectStatus>().unwrap(), s);
        }
        assert!("deleted".parse::<ProjectStatus>().is_err());
    }

    #[test]
    fn priority_orders_by_severity() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Low < Priority::Medium);
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
    }
}
