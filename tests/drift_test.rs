mod helpers;

use canon::drift::report::DriftStatus;
use canon::registry::types::Priority;
use helpers::{event, SECRET};

const PLAN_BODY: &str = "Validate JWT tokens in the authentication middleware";

async fn project_with_plan(env: &helpers::TestEnv) -> (String, String) {
    let root = env.source_root("service");
    let project = env
        .canon
        .create_project("service", &root.to_string_lossy(), vec![])
        .await
        .unwrap();
    let receipt = env
        .canon
        .create_sacred_plan(&project.id, "Auth Design", PLAN_BODY, None)
        .await
        .unwrap();
    env.canon
        .approve_sacred_plan(&receipt.plan_id, &receipt.verification_code, SECRET, "lead")
        .await
        .unwrap();
    (project.id, receipt.plan_id)
}

#[tokio::test]
async fn matching_activity_is_aligned() {
    let env = helpers::test_canon_with_events(vec![
        event("c1", PLAN_BODY, &[], 1),
        event("c2", PLAN_BODY, &[], 3),
    ]);
    let (pid, plan_id) = project_with_plan(&env).await;

    let report = env.canon.check_drift(&pid, 24).await.unwrap();
    assert_eq!(report.events_analyzed, 2);
    assert!(report.alignment_score >= 0.9, "score {}", report.alignment_score);
    assert_eq!(report.status, DriftStatus::Aligned);
    assert_eq!(report.plan_scores.len(), 1);
    assert_eq!(report.plan_scores[0].plan_id, plan_id);
    assert_eq!(report.plan_scores[0].events_attributed, 2);
}

#[tokio::test]
async fn unrelated_activity_is_a_critical_violation() {
    let env = helpers::test_canon_with_events(vec![event(
        "c1",
        "Switch chart palette colors to pastel",
        &["styles/palette.css"],
        2,
    )]);
    let (pid, _) = project_with_plan(&env).await;

    let report = env.canon.check_drift(&pid, 24).await.unwrap();
    assert!(report.alignment_score < 0.5, "score {}", report.alignment_score);
    assert_eq!(report.status, DriftStatus::CriticalViolation);

    let first = &report.recommendations[0];
    assert_eq!(first.priority, Priority::High);
    assert!(first.files.iter().any(|f| f == "styles/palette.css"));
}

#[tokio::test]
async fn no_activity_is_aligned_with_note() {
    let env = helpers::test_canon();
    let (pid, _) = project_with_plan(&env).await;

    let report = env.canon.check_drift(&pid, 24).await.unwrap();
    assert_eq!(report.alignment_score, 1.0);
    assert_eq!(report.status, DriftStatus::Aligned);
    assert_eq!(report.events_analyzed, 0);
    assert!(report.note.is_some());
    assert!(report.recommendations.is_empty());
}

#[tokio::test]
async fn superseded_plans_are_not_a_baseline() {
    let env = helpers::test_canon_with_events(vec![event("c1", PLAN_BODY, &[], 1)]);
    let (pid, old_plan) = project_with_plan(&env).await;

    let successor = env
        .canon
        .propose_superseding_plan(
            &pid,
            &old_plan,
            "Rendering",
            "Render pastel chart palettes on the dashboard",
            None,
        )
        .await
        .unwrap();
    env.canon
        .approve_sacred_plan(&successor.plan_id, &successor.verification_code, SECRET, "lead")
        .await
        .unwrap();

    let report = env.canon.check_drift(&pid, 24).await.unwrap();
    assert_eq!(report.plan_scores.len(), 1);
    assert_eq!(report.plan_scores[0].plan_id, successor.plan_id);
    assert!(report.alignment_score < 0.9);
}

#[tokio::test]
async fn window_bounds_are_enforced() {
    let env = helpers::test_canon();
    let (pid, _) = project_with_plan(&env).await;

    assert_eq!(env.canon.check_drift(&pid, 0).await.unwrap_err().kind(), "validation_error");
    assert_eq!(
        env.canon.check_drift(&pid, 8761).await.unwrap_err().kind(),
        "validation_error"
    );
    assert_eq!(
        env.canon.check_drift("missing", 24).await.unwrap_err().kind(),
        "not_found_error"
    );
}

#[tokio::test]
async fn activity_without_any_plan_is_a_critical_violation() {
    let env = helpers::test_canon_with_events(vec![event(
        "c1",
        "Switch chart palette colors to pastel",
        &["styles/palette.css"],
        2,
    )]);
    let root = env.source_root("unplanned");
    let project = env
        .canon
        .create_project("unplanned", &root.to_string_lossy(), vec![])
        .await
        .unwrap();

    let report = env.canon.check_drift(&project.id, 24).await.unwrap();
    assert_eq!(report.events_analyzed, 1);
    assert_eq!(report.alignment_score, 0.0);
    assert_eq!(report.status, DriftStatus::CriticalViolation);
    assert!(report.plan_scores.is_empty());
    assert_eq!(report.recommendations[0].priority, Priority::High);
}
