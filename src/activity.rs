//! Recent development activity, the input of drift detection.
//!
//! [`ActivityReader`] is the collaborator seam. [`GitLogReader`] shells out to
//! `git log`; [`StaticActivityReader`] serves a fixed list.

use std::path::Path;
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub commit_id: String,
    pub changed_files: Vec<String>,
    pub branch: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl ActivityEvent {
    /// Text used to embed the event: message followed by the changed paths.
    pub fn summary(&self) -> String {
        if self.changed_files.is_empty() {
            return self.message.clone();
        }
        format!("{}\n{}", self.message, self.changed_files.join("\n"))
    }
}

pub trait ActivityReader: Send + Sync {
    /// Events in `root` with `since <= timestamp <= until`, newest first.
    fn read(
        &self,
        root: &Path,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ActivityEvent>, ProviderError>;
}

/// Fixed events, filtered by window. Ignores `root`.
#[derive(Debug, Clone, Default)]
pub struct StaticActivityReader {
    events: Vec<ActivityEvent>,
}

impl StaticActivityReader {
    pub fn new(events: Vec<ActivityEvent>) -> Self {
        Self { events }
    }
}

impl ActivityReader for StaticActivityReader {
    fn read(
        &self,
        _root: &Path,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ActivityEvent>, ProviderError> {
        let mut events: Vec<ActivityEvent> = self
            .events
            .iter()
            .filter(|e| e.timestamp >= since && e.timestamp <= until)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(events)
    }
}

const RECORD_SEP: char = '\u{1e}';
const FIELD_SEP: char = '\u{1f}';

/// Reads commits of the checked-out branch with `git log`.
#[derive(Debug, Clone)]
pub struct GitLogReader {
    max_events: usize,
}

impl GitLogReader {
    pub fn new(max_events: usize) -> Self {
        Self { max_events }
    }
}

fn git(root: &Path, args: &[&str]) -> Result<String, ProviderError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .map_err(|e| ProviderError::Permanent(format!("failed to run git: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProviderError::Permanent(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl ActivityReader for GitLogReader {
    fn read(
        &self,
        root: &Path,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ActivityEvent>, ProviderError> {
        let branch = git(root, &["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string();
        let since_arg = format!("--since={}", since.to_rfc3339());
        let until_arg = format!("--until={}", until.to_rfc3339());
        let max_arg = format!("--max-count={}", self.max_events);
        let stdout = git(
            root,
            &[
                "log",
                &since_arg,
                &until_arg,
                &max_arg,
                "--name-only",
                "--format=%x1e%H%x1f%ct%x1f%s",
            ],
        )?;
        let events = parse_git_log(&stdout, &branch);
        tracing::debug!(root = %root.display(), events = events.len(), "read git activity");
        Ok(events)
    }
}

/// Parse `git log --name-only --format=%x1e%H%x1f%ct%x1f%s` output.
/// Malformed records are skipped.
pub fn parse_git_log(output: &str, branch: &str) -> Vec<ActivityEvent> {
    output
        .split(RECORD_SEP)
        .filter_map(|record| {
            let mut lines = record.lines();
            let header = lines.next()?;
            let mut fields = header.splitn(3, FIELD_SEP);
            let commit_id = fields.next()?.trim().to_string();
            let seconds: i64 = fields.next()?.trim().parse().ok()?;
            let message = fields.next().unwrap_or_default().trim().to_string();
            let timestamp = DateTime::from_timestamp(seconds, 0)?;
            if commit_id.is_empty() {
                return None;
            }
            let changed_files = lines
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
            Some(ActivityEvent {
                commit_id,
                changed_files,
                branch: branch.to_string(),
                timestamp,
                message,
            })
        })
        .collect()
}
