//! Drift report types and the pure scoring that feeds them.

use serde::Serialize;

use crate::registry::types::Priority;
use crate::sacred::types::SacredPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    Aligned,
    MinorDrift,
    ModerateDrift,
    CriticalViolation,
}

impl DriftStatus {
    /// ≥0.90 aligned, ≥0.70 minor, ≥0.50 moderate, below that critical.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.90 {
            Self::Aligned
        } else if score >= 0.70 {
            Self::MinorDrift
        } else if score >= 0.50 {
            Self::ModerateDrift
        } else {
            Self::CriticalViolation
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aligned => "aligned",
            Self::MinorDrift => "minor_drift",
            Self::ModerateDrift => "moderate_drift",
            Self::CriticalViolation => "critical_violation",
        }
    }
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanAdherence {
    pub plan_id: String,
    pub title: String,
    pub adherence: f64,
    pub events_attributed: usize,
    pub specificity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub project_id: String,
    pub window_hours: u32,
    pub alignment_score: f64,
    pub status: DriftStatus,
    pub plan_scores: Vec<PlanAdherence>,
    pub recommendations: Vec<Recommendation>,
    pub events_analyzed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub generated_at: String,
}

/// One activity event after embedding: its age and its similarity to each plan
/// (same order as the plan slice).
#[derive(Debug, Clone)]
pub struct ScoredEvent {
    pub commit_id: String,
    pub changed_files: Vec<String>,
    pub age_hours: f64,
    pub similarity: Vec<f64>,
}

impl ScoredEvent {
    /// Index and similarity of the best plan. Ties go to the earlier plan.
    pub fn best(&self) -> Option<(usize, f64)> {
        self.similarity
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (i, s)| match best {
                Some((_, b)) if b >= s => best,
                _ => Some((i, s)),
            })
    }
}

pub fn recency_weight(age_hours: f64, half_life_hours: f64) -> f64 {
    0.5f64.powf(age_hours.max(0.0) / half_life_hours)
}

/// Smaller, more targeted plans weigh more.
pub fn specificity(segment_count: usize) -> f64 {
    1.0 / (1.0 + (1.0 + segment_count as f64).ln())
}

/// Per-plan adherence and the overall alignment score.
///
/// Each event counts toward its best plan only. A plan's adherence is the
/// recency-weighted mean similarity of its events; plans without events
/// report their mean over all events but carry no weight.
pub fn aggregate(
    plans: &[SacredPlan],
    events: &[ScoredEvent],
    half_life_hours: f64,
) -> (f64, Vec<PlanAdherence>) {
    let weights: Vec<f64> = events
        .iter()
        .map(|e| recency_weight(e.age_hours, half_life_hours))
        .collect();
    let total_weight: f64 = weights.iter().sum();
    let best: Vec<Option<usize>> = events.iter().map(|e| e.best().map(|(i, _)| i)).collect();

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    let mut scores = Vec::with_capacity(plans.len());

    for (p, plan) in plans.iter().enumerate() {
        let mut weight = 0.0;
        let mut weighted_sim = 0.0;
        let mut attributed = 0;
        for (e, event) in events.iter().enumerate() {
            if best[e] == Some(p) {
                weight += weights[e];
                weighted_sim += weights[e] * event.similarity[p];
                attributed += 1;
            }
        }

        let adherence = if weight > 0.0 {
            weighted_sim / weight
        } else if total_weight > 0.0 {
            events
                .iter()
                .zip(&weights)
                .map(|(event, w)| w * event.similarity[p])
                .sum::<f64>()
                / total_weight
        } else {
            1.0
        };
        let spec = specificity(plan.segment_count);
        numerator += spec * weight * adherence;
        denominator += spec * weight;

        scores.push(PlanAdherence {
            plan_id: plan.id.clone(),
            title: plan.title.clone(),
            adherence: adherence.clamp(0.0, 1.0),
            events_attributed: attributed,
            specificity: spec,
        });
    }

    let overall = if denominator > 0.0 {
        (numerator / denominator).clamp(0.0, 1.0)
    } else {
        1.0
    };
    (overall, scores)
}

const MAX_LISTED_FILES: usize = 10;

/// Recommendations, most urgent first.
pub fn recommend(
    events: &[ScoredEvent],
    scores: &[PlanAdherence],
    unrelated_threshold: f64,
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    let unrelated: Vec<&ScoredEvent> = events
        .iter()
        .filter(|e| e.best().map_or(true, |(_, s)| s < unrelated_threshold))
        .collect();
    if !unrelated.is_empty() {
        let mut files: Vec<String> = Vec::new();
        for event in &unrelated {
            let listed = if event.changed_files.is_empty() {
                std::slice::from_ref(&event.commit_id)
            } else {
                event.changed_files.as_slice()
            };
            for f in listed {
                if files.len() < MAX_LISTED_FILES && !files.contains(f) {
                    files.push(f.clone());
                }
            }
        }
        out.push(Recommendation {
            priority: Priority::High,
            message: format!(
                "{} recent change(s) touch files unrelated to any approved plan; \
                 document them in a plan or revert them",
                unrelated.len()
            ),
            plan_id: None,
            files,
        });
    }

    for score in scores {
        if score.events_attributed > 0 && score.adherence < 0.70 {
            out.push(Recommendation {
                priority: Priority::Medium,
                message: format!(
                    "activity related to plan {:?} scores {:.2}; review it against the plan",
                    score.title, score.adherence
                ),
                plan_id: Some(score.plan_id.clone()),
                files: Vec::new(),
            });
        }
    }

    for score in scores {
        if score.events_attributed == 0 {
            out.push(Recommendation {
                priority: Priority::Low,
                message: format!("no recent activity relates to plan {:?}", score.title),
                plan_id: Some(score.plan_id.clone()),
                files: Vec::new(),
            });
        }
    }

    out.sort_by(|a, b| b.priority.cmp(&a.priority));
    out
}
