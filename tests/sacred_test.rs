mod helpers;

use canon::sacred::types::PlanStatus;
use helpers::SECRET;

const AUTH_PLAN: &str = "# Auth Design\n\nAll requests are authenticated with short-lived JWT tokens.\nTokens are validated in middleware before any handler runs.\n";

async fn project(env: &helpers::TestEnv, name: &str) -> String {
    let root = env.source_root(name);
    env.canon
        .create_project(name, &root.to_string_lossy(), vec![])
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn create_submits_and_returns_code() {
    let env = helpers::test_canon();
    let pid = project(&env, "plans").await;

    let receipt = env
        .canon
        .create_sacred_plan(&pid, "Auth Design", AUTH_PLAN, Some("alice"))
        .await
        .unwrap();
    assert_eq!(receipt.verification_code.len(), env.canon.config().sacred.verification_code_length);

    let plan = env.canon.get_sacred_plan(&receipt.plan_id).await.unwrap();
    assert_eq!(plan.status, PlanStatus::PendingApproval);
    assert_eq!(plan.project_id, pid);
    assert!(plan.approver.is_none());

    let history = env.canon.plan_history(&receipt.plan_id).await.unwrap();
    let ops: Vec<&str> = history.iter().map(|e| e.operation.as_str()).collect();
    assert!(ops.contains(&"create"));
    assert!(ops.contains(&"submit"));
}

#[tokio::test]
async fn approval_requires_both_credentials() {
    let env = helpers::test_canon();
    let pid = project(&env, "plans").await;
    let receipt = env
        .canon
        .create_sacred_plan(&pid, "Auth Design", AUTH_PLAN, None)
        .await
        .unwrap();

    let err = env
        .canon
        .approve_sacred_plan(&receipt.plan_id, "WRONGCODE1", SECRET, "lead")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "authorization_error");

    let err = env
        .canon
        .approve_sacred_plan(&receipt.plan_id, &receipt.verification_code, "not-the-secret", "lead")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "authorization_error");

    // Nothing changed after the failed attempts.
    let plan = env.canon.get_sacred_plan(&receipt.plan_id).await.unwrap();
    assert_eq!(plan.status, PlanStatus::PendingApproval);
    assert!(plan.approved_at.is_none());
    let rejects = env
        .canon
        .plan_history(&receipt.plan_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.operation == "reject")
        .count();
    assert_eq!(rejects, 2);

    let plan = env
        .canon
        .approve_sacred_plan(
            &receipt.plan_id,
            &receipt.verification_code.to_lowercase(),
            SECRET,
            "lead",
        )
        .await
        .unwrap();
    assert_eq!(plan.status, PlanStatus::Approved);
    assert_eq!(plan.approver.as_deref(), Some("lead"));
    assert!(plan.approved_at.is_some());
}

#[tokio::test]
async fn approved_plan_content_is_immutable() {
    let env = helpers::test_canon();
    let pid = project(&env, "plans").await;
    let receipt = env
        .canon
        .create_sacred_plan(&pid, "Auth Design", AUTH_PLAN, None)
        .await
        .unwrap();
    env.canon
        .approve_sacred_plan(&receipt.plan_id, &receipt.verification_code, SECRET, "lead")
        .await
        .unwrap();

    let err = env
        .canon
        .update_plan_draft(&receipt.plan_id, "Auth Design", "rewritten", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "consistency_error");

    // A second approval is refused: the plan is no longer pending.
    let err = env
        .canon
        .approve_sacred_plan(&receipt.plan_id, &receipt.verification_code, SECRET, "lead")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "consistency_error");

    // Bypassing the API does not help either.
    let path = env.canon.config().project_dir(&pid).join("sacred.db");
    let conn = rusqlite::Connection::open(path).unwrap();
    let update = conn.execute(
        "UPDATE sacred_plans SET body = 'tampered' WHERE id = ?1",
        [&receipt.plan_id],
    );
    assert!(update.is_err());
    let delete = conn.execute("DELETE FROM sacred_plans WHERE id = ?1", [&receipt.plan_id]);
    assert!(delete.is_err());
    let demote = conn.execute(
        "UPDATE sacred_plans SET status = 'draft' WHERE id = ?1",
        [&receipt.plan_id],
    );
    assert!(demote.is_err());

    let plan = env.canon.get_sacred_plan(&receipt.plan_id).await.unwrap();
    assert_eq!(plan.body, AUTH_PLAN);
    assert_eq!(plan.status, PlanStatus::Approved);
}

#[tokio::test]
async fn lock_is_forward_only() {
    let env = helpers::test_canon();
    let pid = project(&env, "plans").await;
    let receipt = env
        .canon
        .create_sacred_plan(&pid, "Auth Design", AUTH_PLAN, None)
        .await
        .unwrap();

    let err = env.canon.lock_sacred_plan(&receipt.plan_id, None).await.unwrap_err();
    assert_eq!(err.kind(), "consistency_error");

    env.canon
        .approve_sacred_plan(&receipt.plan_id, &receipt.verification_code, SECRET, "lead")
        .await
        .unwrap();
    let plan = env.canon.lock_sacred_plan(&receipt.plan_id, Some("lead")).await.unwrap();
    assert_eq!(plan.status, PlanStatus::Locked);
    assert!(plan.locked_at.is_some());

    let err = env.canon.lock_sacred_plan(&receipt.plan_id, None).await.unwrap_err();
    assert_eq!(err.kind(), "consistency_error");
}

#[tokio::test]
async fn concurrent_approvals_have_one_winner() {
    let env = helpers::test_canon();
    let pid = project(&env, "plans").await;
    let receipt = env
        .canon
        .create_sacred_plan(&pid, "Auth Design", AUTH_PLAN, None)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let canon = env.canon.clone();
        let plan_id = receipt.plan_id.clone();
        let code = receipt.verification_code.clone();
        tasks.push(tokio::spawn(async move {
            canon
                .approve_sacred_plan(&plan_id, &code, SECRET, &format!("approver-{i}"))
                .await
        }));
    }

    let mut ok = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e.kind(), "consistency_error"),
        }
    }
    assert_eq!(ok, 1);

    let approvals = env
        .canon
        .plan_history(&receipt.plan_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.operation == "approve")
        .count();
    assert_eq!(approvals, 1);
}

#[tokio::test]
async fn superseding_plan_replaces_original_on_approval() {
    let env = helpers::test_canon();
    let pid = project(&env, "plans").await;
    let first = env
        .canon
        .create_sacred_plan(&pid, "Auth Design", AUTH_PLAN, None)
        .await
        .unwrap();
    env.canon
        .approve_sacred_plan(&first.plan_id, &first.verification_code, SECRET, "lead")
        .await
        .unwrap();

    let second = env
        .canon
        .propose_superseding_plan(
            &pid,
            &first.plan_id,
            "Auth Design v2",
            "Requests are authenticated with session cookies.\n",
            None,
        )
        .await
        .unwrap();

    // Still in force until the successor is approved.
    let original = env.canon.get_sacred_plan(&first.plan_id).await.unwrap();
    assert_eq!(original.status, PlanStatus::Approved);

    env.canon
        .approve_sacred_plan(&second.plan_id, &second.verification_code, SECRET, "lead")
        .await
        .unwrap();
    let original = env.canon.get_sacred_plan(&first.plan_id).await.unwrap();
    assert_eq!(original.status, PlanStatus::Superseded);
    assert_eq!(original.superseded_by.as_deref(), Some(second.plan_id.as_str()));

    let superseded = env
        .canon
        .list_sacred_plans(&pid, Some(PlanStatus::Superseded))
        .await
        .unwrap();
    assert_eq!(superseded.len(), 1);
}

#[tokio::test]
async fn plans_are_scoped_to_their_project() {
    let env = helpers::test_canon();
    let a = project(&env, "a").await;
    let b = project(&env, "b").await;

    let receipt = env
        .canon
        .create_sacred_plan(&a, "Auth Design", AUTH_PLAN, None)
        .await
        .unwrap();
    env.canon
        .approve_sacred_plan(&receipt.plan_id, &receipt.verification_code, SECRET, "lead")
        .await
        .unwrap();

    let hits = env
        .canon
        .query_sacred_plans(&a, "how are tokens validated", 3)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].plan.id, receipt.plan_id);

    let hits = env
        .canon
        .query_sacred_plans(&b, "how are tokens validated", 3)
        .await
        .unwrap();
    assert!(hits.is_empty());
    assert!(env.canon.list_sacred_plans(&b, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn sacred_plans_do_not_leak_into_knowledge_queries() {
    let env = helpers::test_canon();
    let pid = project(&env, "plans").await;
    let receipt = env
        .canon
        .create_sacred_plan(&pid, "Auth Design", AUTH_PLAN, None)
        .await
        .unwrap();
    env.canon
        .approve_sacred_plan(&receipt.plan_id, &receipt.verification_code, SECRET, "lead")
        .await
        .unwrap();

    let response = env
        .canon
        .query(canon::knowledge::query::QueryRequest::new(&pid, "JWT tokens middleware"))
        .await
        .unwrap();
    assert!(response.results.is_empty());
}
