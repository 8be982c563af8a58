mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use canon::config::CanonConfig;

#[derive(Parser)]
#[command(name = "canon", version, about = "Per-project knowledge index with sacred plans and drift detection")]
struct Cli {
    /// Config file (defaults to ~/.canon/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check databases, embedding identity and project counts
    Health,
    /// Manage projects
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },
    /// Index a project's files (project id or name)
    Ingest {
        project: String,
        /// Directory to walk; defaults to the project's root path
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Ask a question against one project
    Query {
        project: String,
        question: String,
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Manage sacred plans
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },
    /// Compare recent commits with the plans in force
    Drift {
        project: String,
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    Create {
        name: String,
        root: PathBuf,
        #[arg(long = "watch")]
        watch_paths: Vec<String>,
    },
    List {
        /// active, paused or archived
        #[arg(long)]
        status: Option<String>,
    },
    Focus { project: String },
    Pause { project: String },
    Resume { project: String },
    Archive { project: String },
    Unarchive { project: String },
}

#[derive(Subcommand)]
enum PlanAction {
    /// Draft and submit a plan; prints the verification code
    Create {
        project: String,
        #[arg(long)]
        title: String,
        /// File holding the plan body
        #[arg(long)]
        body: PathBuf,
        #[arg(long)]
        author: Option<String>,
    },
    /// Approve a pending plan; the secondary secret is read from stdin
    Approve {
        plan_id: String,
        #[arg(long)]
        code: String,
        #[arg(long)]
        approver: String,
    },
    Lock { plan_id: String },
    List {
        project: String,
        #[arg(long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CanonConfig::load_from(path)?,
        None => CanonConfig::load()?,
    };

    // Log to stderr so stdout stays clean for JSON output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let canon = canon::Canon::open(config)?;

    match cli.command {
        Command::Health => cli::doctor::doctor(&canon).await?,
        Command::Project { action } => match action {
            ProjectAction::Create {
                name,
                root,
                watch_paths,
            } => cli::project_create(&canon, &name, &root, watch_paths).await?,
            ProjectAction::List { status } => cli::project_list(&canon, status.as_deref()).await?,
            ProjectAction::Focus { project } => cli::project_focus(&canon, &project).await?,
            ProjectAction::Pause { project } => cli::project_pause(&canon, &project).await?,
            ProjectAction::Resume { project } => cli::project_resume(&canon, &project).await?,
            ProjectAction::Archive { project } => cli::project_archive(&canon, &project).await?,
            ProjectAction::Unarchive { project } => cli::project_unarchive(&canon, &project).await?,
        },
        Command::Ingest { project, root } => cli::ingest(&canon, &project, root).await?,
        Command::Query { project, question, k } => cli::query(&canon, &project, &question, k).await?,
        Command::Plan { action } => match action {
            PlanAction::Create {
                project,
                title,
                body,
                author,
            } => cli::plan_create(&canon, &project, &title, &body, author.as_deref()).await?,
            PlanAction::Approve {
                plan_id,
                code,
                approver,
            } => cli::plan_approve(&canon, &plan_id, &code, &approver).await?,
            PlanAction::Lock { plan_id } => cli::plan_lock(&canon, &plan_id).await?,
            PlanAction::List { project, status } => {
                cli::plan_list(&canon, &project, status.as_deref()).await?
            }
        },
        Command::Drift { project, hours } => cli::drift(&canon, &project, hours).await?,
    }

    Ok(())
}
