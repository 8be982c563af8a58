//! End-to-end walk through a single project: create, ingest, query, plan,
//! approve, check drift.

mod helpers;

use canon::drift::report::DriftStatus;
use canon::knowledge::query::QueryRequest;
use canon::sacred::types::PlanStatus;
use helpers::SECRET;

#[tokio::test]
async fn demo_project_lifecycle() {
    let env = helpers::test_canon();
    let root = env.source_root("demo");
    helpers::write_file(&root, "main.py", "def authenticate(user): ...\n");

    let project = env
        .canon
        .create_project("demo", &root.to_string_lossy(), vec!["main.py".into()])
        .await
        .unwrap();
    assert_eq!(project.watch_paths, vec!["main.py".to_string()]);

    let summary = env.canon.ingest_and_wait(&project.id, None).await.unwrap();
    assert_eq!(summary.files_ingested, 1);

    let response = env
        .canon
        .query(QueryRequest::new(&project.id, "how does authentication work"))
        .await
        .unwrap();
    assert_eq!(response.results[0].file_path, "main.py");
    assert!(response.results[0].text.contains("def authenticate(user)"));

    let receipt = env
        .canon
        .create_sacred_plan(
            &project.id,
            "Auth Design",
            "Requests carry a signed bearer token; authenticate() verifies it before any handler runs.\n",
            Some("dev"),
        )
        .await
        .unwrap();
    let plan = env
        .canon
        .approve_sacred_plan(&receipt.plan_id, &receipt.verification_code, SECRET, "lead")
        .await
        .unwrap();
    assert_eq!(plan.status, PlanStatus::Approved);

    let in_force = env
        .canon
        .list_sacred_plans(&project.id, Some(PlanStatus::Approved))
        .await
        .unwrap();
    assert_eq!(in_force.len(), 1);
    assert_eq!(in_force[0].title, "Auth Design");

    let report = env.canon.check_drift(&project.id, 24).await.unwrap();
    assert_eq!(report.status, DriftStatus::Aligned);
    assert_eq!(report.alignment_score, 1.0);

    let health = env.canon.health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.projects_active, 1);
    assert!(health.approval_secret_configured);
    assert_eq!(health.embedding.dimensions, 128);
}

#[tokio::test]
async fn reopening_keeps_projects_and_indexes() {
    let env = helpers::test_canon();
    let root = env.source_root("persist");
    helpers::write_file(&root, "notes.md", "# Notes\n\nThe cache is flushed nightly.\n");
    let project = env
        .canon
        .create_project("persist", &root.to_string_lossy(), vec![])
        .await
        .unwrap();
    env.canon.ingest_and_wait(&project.id, None).await.unwrap();

    let reopened = canon::Canon::builder(env.canon.config().clone())
        .retry_policy(canon::retry::RetryPolicy::immediate(1))
        .build()
        .unwrap();
    let found = reopened.find_project_by_name("persist").await.unwrap().unwrap();
    assert_eq!(found.id, project.id);

    let response = reopened
        .query(QueryRequest::new(&project.id, "when is the cache flushed"))
        .await
        .unwrap();
    assert_eq!(response.results[0].file_path, "notes.md");
}
