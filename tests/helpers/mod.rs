#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use canon::activity::{ActivityEvent, StaticActivityReader};
use canon::config::CanonConfig;
use canon::embedding::EmbeddingProvider;
use canon::retry::RetryPolicy;
use canon::sacred::types::ApprovalSecret;
use canon::Canon;
use chrono::{Duration, Utc};
use tempfile::TempDir;

/// Secondary approval secret every test instance is built with.
pub const SECRET: &str = "test-approval-secret";

/// A Canon instance rooted in its own temp directory. Keep `dir` alive for
/// as long as `canon` is used.
pub struct TestEnv {
    pub dir: TempDir,
    pub canon: Canon,
}

impl TestEnv {
    /// Scratch directory for project sources, separate from the data dir.
    pub fn source_root(&self, name: &str) -> std::path::PathBuf {
        let root = self.dir.path().join("src").join(name);
        std::fs::create_dir_all(&root).unwrap();
        root
    }
}

/// Small, fast configuration: 128-dim hashing embeddings, no retries.
pub fn test_config(data_dir: &Path) -> CanonConfig {
    let mut config = CanonConfig::with_data_dir(data_dir);
    config.embedding.dimensions = 128;
    config.embedding.max_retries = 0;
    config.embedding.batch_size = 4;
    config
}

/// Canon with no activity.
pub fn test_canon() -> TestEnv {
    test_canon_with_events(Vec::new())
}

/// Canon whose activity reader serves `events`.
pub fn test_canon_with_events(events: Vec<ActivityEvent>) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir.path().join("data"));
    let canon = Canon::builder(config)
        .activity_reader(Arc::new(StaticActivityReader::new(events)))
        .approval_secret(ApprovalSecret::new(SECRET).unwrap())
        .retry_policy(RetryPolicy::immediate(1))
        .build()
        .unwrap();
    TestEnv { dir, canon }
}

/// Canon embedding through `provider` instead of the configured one.
pub fn test_canon_with_provider(provider: Arc<dyn EmbeddingProvider>) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir.path().join("data"));
    let canon = Canon::builder(config)
        .embedding_provider(provider)
        .activity_reader(Arc::new(StaticActivityReader::new(Vec::new())))
        .approval_secret(ApprovalSecret::new(SECRET).unwrap())
        .retry_policy(RetryPolicy::immediate(2))
        .build()
        .unwrap();
    TestEnv { dir, canon }
}

/// Write `content` to `root/relative`, creating parent directories.
pub fn write_file(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// A commit `hours_ago` hours in the past.
pub fn event(commit_id: &str, message: &str, files: &[&str], hours_ago: i64) -> ActivityEvent {
    ActivityEvent {
        commit_id: commit_id.to_string(),
        changed_files: files.iter().map(|f| f.to_string()).collect(),
        branch: "main".to_string(),
        timestamp: Utc::now() - Duration::hours(hours_ago),
        message: message.to_string(),
    }
}

