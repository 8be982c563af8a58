pub mod doctor;

use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use canon::knowledge::query::QueryRequest;
use canon::registry::types::{Project, ProjectStatus};
use canon::sacred::types::PlanStatus;
use canon::Canon;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Accept either a project id or a project name.
async fn resolve_project(canon: &Canon, key: &str) -> Result<Project> {
    if let Some(project) = canon.find_project_by_name(key).await? {
        return Ok(project);
    }
    Ok(canon.get_project(key).await?)
}

pub async fn project_create(canon: &Canon, name: &str, root: &Path, watch_paths: Vec<String>) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("project root {} does not exist", root.display()))?;
    let project = canon
        .create_project(name, &root.to_string_lossy(), watch_paths)
        .await?;
    print_json(&project)
}

pub async fn project_list(canon: &Canon, status: Option<&str>) -> Result<()> {
    let status = status
        .map(|s| s.parse::<ProjectStatus>().map_err(anyhow::Error::msg))
        .transpose()?;
    print_json(&canon.list_projects(status).await?)
}

pub async fn project_focus(canon: &Canon, key: &str) -> Result<()> {
    let project = resolve_project(canon, key).await?;
    print_json(&canon.focus_project(&project.id).await?)
}

pub async fn project_pause(canon: &Canon, key: &str) -> Result<()> {
    let project = resolve_project(canon, key).await?;
    print_json(&canon.pause_project(&project.id).await?)
}

pub async fn project_resume(canon: &Canon, key: &str) -> Result<()> {
    let project = resolve_project(canon, key).await?;
    print_json(&canon.resume_project(&project.id).await?)
}

pub async fn project_archive(canon: &Canon, key: &str) -> Result<()> {
    let project = resolve_project(canon, key).await?;
    print_json(&canon.archive_project(&project.id).await?)
}

pub async fn project_unarchive(canon: &Canon, key: &str) -> Result<()> {
    let project = resolve_project(canon, key).await?;
    print_json(&canon.unarchive_project(&project.id).await?)
}

pub async fn ingest(canon: &Canon, key: &str, root: Option<PathBuf>) -> Result<()> {
    let project = resolve_project(canon, key).await?;
    let handle = canon.ingest(&project.id, root).await?;
    eprintln!("Ingest job {} started for {}", handle.job_id, project.name);

    let status = canon.wait_for_job(&handle.job_id).await?;
    print_json(&status)?;
    if let Some(summary) = &status.summary {
        if summary.has_failures() {
            eprintln!("{} file(s) failed; see `failures` above", summary.files_failed);
        }
    }
    Ok(())
}

pub async fn query(canon: &Canon, key: &str, question: &str, k: Option<usize>) -> Result<()> {
    let project = resolve_project(canon, key).await?;
    let mut request = QueryRequest::new(&project.id, question);
    request.k = k;
    print_json(&canon.query(request).await?)
}

pub async fn plan_create(
    canon: &Canon,
    key: &str,
    title: &str,
    body_path: &Path,
    author: Option<&str>,
) -> Result<()> {
    let project = resolve_project(canon, key).await?;
    let body = std::fs::read_to_string(body_path)
        .with_context(|| format!("failed to read plan body from {}", body_path.display()))?;
    let receipt = canon
        .create_sacred_plan(&project.id, title, &body, author)
        .await?;
    eprintln!("Keep the verification code; it is shown only once.");
    print_json(&receipt)
}

pub async fn plan_approve(canon: &Canon, plan_id: &str, code: &str, approver: &str) -> Result<()> {
    eprintln!("Secondary approval secret:");
    let mut secret = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut secret)
        .context("failed to read approval secret from stdin")?;
    let plan = canon
        .approve_sacred_plan(plan_id, code, secret.trim_end_matches(['\r', '\n']), approver)
        .await?;
    print_json(&plan)
}

pub async fn plan_lock(canon: &Canon, plan_id: &str) -> Result<()> {
    print_json(&canon.lock_sacred_plan(plan_id, None).await?)
}

pub async fn plan_list(canon: &Canon, key: &str, status: Option<&str>) -> Result<()> {
    let project = resolve_project(canon, key).await?;
    let status = status
        .map(|s| s.parse::<PlanStatus>().map_err(anyhow::Error::msg))
        .transpose()?;
    print_json(&canon.list_sacred_plans(&project.id, status).await?)
}

pub async fn drift(canon: &Canon, key: &str, hours: u32) -> Result<()> {
    let project = resolve_project(canon, key).await?;
    print_json(&canon.check_drift(&project.id, hours).await?)
}
