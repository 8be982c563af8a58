mod helpers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use canon::embedding::hashing::HashingEmbeddingProvider;
use canon::embedding::EmbeddingProvider;
use canon::error::ProviderError;
use canon::knowledge::jobs::JobState;
use canon::knowledge::query::QueryRequest;

/// Fails on text mentioning `flaky_upstream` until `healthy` is set.
struct FlakyProvider {
    inner: HashingEmbeddingProvider,
    healthy: AtomicBool,
}

impl EmbeddingProvider for FlakyProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if text.contains("flaky_upstream") && !self.healthy.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient("connection reset".into()));
        }
        self.inner.embed(text)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[tokio::test]
async fn ingest_then_query_finds_function() {
    let env = helpers::test_canon();
    let root = env.source_root("app");
    helpers::write_file(
        &root,
        "auth.py",
        "def authenticate(user, password):\n    token = issue_token(user)\n    return token\n",
    );
    helpers::write_file(&root, "billing.py", "def charge(invoice):\n    return invoice.total\n");

    let project = env
        .canon
        .create_project("app", &root.to_string_lossy(), vec![])
        .await
        .unwrap();
    let summary = env.canon.ingest_and_wait(&project.id, None).await.unwrap();
    assert_eq!(summary.files_ingested, 2);
    assert!(summary.segments_written >= 2);
    assert!(!summary.has_failures());

    let response = env
        .canon
        .query(QueryRequest::new(&project.id, "where is authenticate defined").with_k(1))
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    let hit = &response.results[0];
    assert_eq!(hit.file_path, "auth.py");
    assert_eq!(hit.start_line, 1);
    assert!(hit.text.contains("def authenticate"));
    assert!(response.answer.is_none());
}

#[tokio::test]
async fn reingest_unchanged_tree_writes_nothing() {
    let env = helpers::test_canon();
    let root = env.source_root("stable");
    helpers::write_file(&root, "lib.rs", "pub fn parse_header(input: &str) -> Header {\n    todo!()\n}\n");
    helpers::write_file(&root, "README.md", "# Stable\n\nParses headers.\n");

    let project = env
        .canon
        .create_project("stable", &root.to_string_lossy(), vec![])
        .await
        .unwrap();
    env.canon.ingest_and_wait(&project.id, None).await.unwrap();
    let before = env
        .canon
        .query(QueryRequest::new(&project.id, "parse header").with_k(10))
        .await
        .unwrap();
    let stats_before = env.canon.index_stats(&project.id).await.unwrap();

    let second = env.canon.ingest_and_wait(&project.id, None).await.unwrap();
    assert_eq!(second.files_skipped, 2);
    assert_eq!(second.files_ingested, 0);
    assert_eq!(second.segments_written, 0);
    assert_eq!(second.files_removed, 0);

    let after = env
        .canon
        .query(QueryRequest::new(&project.id, "parse header").with_k(10))
        .await
        .unwrap();
    let ids = |r: &canon::knowledge::query::QueryResponse| {
        let mut ids: Vec<String> = r.results.iter().map(|h| h.segment_id.clone()).collect();
        ids.sort();
        ids
    };
    assert_eq!(ids(&before), ids(&after));
    let stats_after = env.canon.index_stats(&project.id).await.unwrap();
    assert_eq!(stats_before.segments, stats_after.segments);
}

#[tokio::test]
async fn changed_and_deleted_files_are_reconciled() {
    let env = helpers::test_canon();
    let root = env.source_root("moving");
    helpers::write_file(&root, "a.py", "def alpha():\n    return 1\n");
    helpers::write_file(&root, "b.py", "def beta():\n    return 2\n");

    let project = env
        .canon
        .create_project("moving", &root.to_string_lossy(), vec![])
        .await
        .unwrap();
    env.canon.ingest_and_wait(&project.id, None).await.unwrap();

    helpers::write_file(&root, "a.py", "def alpha_renamed():\n    return 10\n");
    std::fs::remove_file(root.join("b.py")).unwrap();

    let summary = env.canon.ingest_and_wait(&project.id, None).await.unwrap();
    assert_eq!(summary.files_ingested, 1);
    assert_eq!(summary.files_removed, 1);
    assert!(summary.segments_removed >= 2);

    let stats = env.canon.index_stats(&project.id).await.unwrap();
    assert_eq!(stats.files, 1);

    let response = env
        .canon
        .query(QueryRequest::new(&project.id, "beta").with_k(10))
        .await
        .unwrap();
    assert!(response.results.iter().all(|h| h.file_path == "a.py"));
    assert!(response.results.iter().all(|h| !h.text.contains("def alpha():")));
}

#[tokio::test]
async fn ignored_and_hidden_paths_are_not_indexed() {
    let env = helpers::test_canon();
    let root = env.source_root("filtered");
    helpers::write_file(&root, "src/main.rs", "fn main() {\n    serve();\n}\n");
    helpers::write_file(&root, "node_modules/pkg/index.js", "module.exports = serve;\n");
    helpers::write_file(&root, "target/debug/build.rs", "fn serve() {}\n");
    helpers::write_file(&root, ".env.rs", "fn serve() {}\n");
    helpers::write_file(&root, "logo.png", "not really an image");

    let project = env
        .canon
        .create_project("filtered", &root.to_string_lossy(), vec![])
        .await
        .unwrap();
    let summary = env.canon.ingest_and_wait(&project.id, None).await.unwrap();
    assert_eq!(summary.files_ingested, 1);

    let response = env
        .canon
        .query(QueryRequest::new(&project.id, "serve").with_k(10))
        .await
        .unwrap();
    assert!(!response.results.is_empty());
    assert!(response.results.iter().all(|h| h.file_path == "src/main.rs"));
}

#[tokio::test]
async fn credentials_are_redacted_before_indexing() {
    let env = helpers::test_canon();
    let root = env.source_root("secrets");
    helpers::write_file(
        &root,
        "settings.py",
        "DATABASE_HOST = 'db.internal'\napi_key = \"sk9f8e7d6c5b4a3\"\n",
    );

    let project = env
        .canon
        .create_project("secrets", &root.to_string_lossy(), vec![])
        .await
        .unwrap();
    env.canon.ingest_and_wait(&project.id, None).await.unwrap();

    let response = env
        .canon
        .query(QueryRequest::new(&project.id, "database host api key").with_k(5))
        .await
        .unwrap();
    assert!(!response.results.is_empty());
    for hit in &response.results {
        assert!(!hit.text.contains("sk9f8e7d6c5b4a3"));
    }
    assert!(response.results.iter().any(|h| h.text.contains("[REDACTED]")));
}

#[tokio::test]
async fn non_utf8_file_is_reported_and_others_continue() {
    let env = helpers::test_canon();
    let root = env.source_root("mixed");
    helpers::write_file(&root, "good.txt", "plain readable notes about caching\n");
    std::fs::write(root.join("bad.txt"), [0xff, 0xfe, 0x00, 0x81, 0x92]).unwrap();

    let project = env
        .canon
        .create_project("mixed", &root.to_string_lossy(), vec![])
        .await
        .unwrap();
    let summary = env.canon.ingest_and_wait(&project.id, None).await.unwrap();
    assert_eq!(summary.files_ingested, 1);
    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.failures[0].path, "bad.txt");
    assert!(summary.has_failures());
}

#[tokio::test]
async fn background_job_reports_completion() {
    let env = helpers::test_canon();
    let root = env.source_root("bg");
    for i in 0..5 {
        helpers::write_file(&root, &format!("mod{i}.rs"), &format!("pub fn handler_{i}() {{}}\n"));
    }
    let project = env
        .canon
        .create_project("bg", &root.to_string_lossy(), vec![])
        .await
        .unwrap();

    let handle = env.canon.ingest(&project.id, None).await.unwrap();
    assert_eq!(handle.project_id, project.id);

    let status = env.canon.wait_for_job(&handle.job_id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    let summary = status.summary.unwrap();
    assert_eq!(summary.files_ingested, 5);
    assert_eq!(status.files_total, 5);

    let jobs = env.canon.list_jobs(Some(&project.id)).unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(env.canon.list_jobs(Some("other")).unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_job_ends_in_terminal_state() {
    let env = helpers::test_canon();
    let root = env.source_root("cancel");
    for i in 0..50 {
        helpers::write_file(&root, &format!("file{i}.md"), &format!("# Note {i}\n\nSome text {i}.\n"));
    }
    let project = env
        .canon
        .create_project("cancel", &root.to_string_lossy(), vec![])
        .await
        .unwrap();

    let handle = env.canon.ingest(&project.id, None).await.unwrap();
    env.canon.cancel_job(&handle.job_id).unwrap();
    let status = env.canon.wait_for_job(&handle.job_id).await.unwrap();

    // The job may finish before the cancel lands.
    assert!(matches!(status.state, JobState::Cancelled | JobState::Completed));
    if status.state == JobState::Cancelled {
        assert!(status.summary.map(|s| s.cancelled).unwrap_or(true));
    }
}

#[tokio::test]
async fn ingest_rejects_archived_project_and_bad_root() {
    let env = helpers::test_canon();
    let root = env.source_root("archived");
    let project = env
        .canon
        .create_project("archived", &root.to_string_lossy(), vec![])
        .await
        .unwrap();

    let err = env
        .canon
        .ingest(&project.id, Some(root.join("missing")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    env.canon.archive_project(&project.id).await.unwrap();
    let err = env.canon.ingest(&project.id, None).await.unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let err = env.canon.get_status("no-such-job").unwrap_err();
    assert_eq!(err.kind(), "not_found_error");
}

#[tokio::test]
async fn embedding_failure_skips_one_file_and_rerun_retries_it() {
    let provider = Arc::new(FlakyProvider {
        inner: HashingEmbeddingProvider::new("canon-hashing-v1", 128),
        healthy: AtomicBool::new(false),
    });
    let env = helpers::test_canon_with_provider(provider.clone());
    let root = env.source_root("flaky");
    helpers::write_file(&root, "client.py", "def call_flaky_upstream():\n    return fetch()\n");
    helpers::write_file(&root, "model.py", "class Invoice:\n    total = 0\n");

    let project = env
        .canon
        .create_project("flaky", &root.to_string_lossy(), vec![])
        .await
        .unwrap();

    let first = env.canon.ingest_and_wait(&project.id, None).await.unwrap();
    assert_eq!(first.files_ingested, 1);
    assert_eq!(first.files_failed, 1);
    assert_eq!(first.failures[0].path, "client.py");
    assert!(first.failures[0].reason.contains("embedding failed after 2 attempt(s)"));
    assert_eq!(env.canon.index_stats(&project.id).await.unwrap().files, 1);

    provider.healthy.store(true, Ordering::SeqCst);
    let second = env.canon.ingest_and_wait(&project.id, None).await.unwrap();
    assert_eq!(second.files_ingested, 1);
    assert_eq!(second.files_skipped, 1);
    assert_eq!(second.files_failed, 0);

    let response = env
        .canon
        .query(QueryRequest::new(&project.id, "call_flaky_upstream").with_k(1))
        .await
        .unwrap();
    assert_eq!(response.results[0].file_path, "client.py");
}
