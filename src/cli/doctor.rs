//! CLI `health` command — run diagnostics and print a health report.

use anyhow::{Context, Result};

use canon::Canon;

/// Run registry diagnostics and print a health report.
pub async fn doctor(canon: &Canon) -> Result<()> {
    let config = canon.config();
    let registry_path = config.registry_db_path();
    let file_size = std::fs::metadata(&registry_path)
        .map(|m| m.len())
        .unwrap_or(0);

    let report = canon.health().await.context("failed to run health check")?;

    println!("Canon Health Report");
    println!("===================");
    println!();
    println!("Status:            {}", report.status);
    println!("Version:           {}", report.version);
    println!("Registry:          {}", registry_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.database.schema_version);
    println!("sqlite-vec:        {}", report.database.sqlite_vec_version);
    println!();
    println!("Embedding:");
    println!("  Provider:        {}", config.embedding.provider);
    println!("  Model:           {}", report.embedding.model);
    println!("  Dimensions:      {}", report.embedding.dimensions);
    println!();
    println!("Projects:");
    println!("  Active:          {}", report.projects_active);
    println!("  Paused:          {}", report.projects_paused);
    println!("  Archived:        {}", report.projects_archived);
    println!();
    if report.approval_secret_configured {
        println!("Approval secret:   configured");
    } else {
        println!(
            "Approval secret:   MISSING (set {} to enable plan approval)",
            config.sacred.approval_secret_env
        );
    }
    if report.database.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.database.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Restore registry.db from a backup");
        println!("  2. Project indexes can be rebuilt with `canon ingest <project>`");
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
