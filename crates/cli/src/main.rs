//! The `grove` binary: discover repositories, probe their upstream state,
//! run one batch mode across all of them, and report.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use git::{GitCli, GitService};
use services::services::{
    config,
    discovery::discover_repositories,
    events::{EVALUATION_REQUESTED, EventPayload},
    jobs::{BatchQueue, JobBuilder, JobOptions, Mode},
    ops::{Operation, OperationOutcome},
    repo::{RepoStatus, Repository},
    trace,
};
use tracing_subscriber::{EnvFilter, prelude::*};

/// Batch operations across many local git repositories.
#[derive(Debug, Parser)]
#[command(name = "grove", version, about)]
struct Args {
    /// Directories to scan for repositories (defaults to the configured
    /// paths, then the current directory).
    paths: Vec<PathBuf>,

    /// Operation to run against every discovered repository.
    #[arg(long)]
    mode: Option<Mode>,

    /// Discovery depth below each base directory.
    #[arg(long)]
    recursion: Option<usize>,

    /// Non-interactive one-shot: suppress per-repository success states in
    /// favour of a quiet summary.
    #[arg(long)]
    quick: bool,

    /// Write an event trace to grove-trace.log.
    #[arg(long)]
    trace: bool,

    /// Configuration file (default: the platform config directory).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,cli={level},services={level},git={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let args = Args::parse();
    let file_config = config::load(args.config.as_deref());

    let mode = args.mode.unwrap_or_else(|| file_config.mode());
    let recursion = args.recursion.unwrap_or(file_config.recursion);
    let quick = args.quick || file_config.quick;
    let mut paths = if args.paths.is_empty() {
        file_config.paths.clone()
    } else {
        args.paths.clone()
    };
    if paths.is_empty() {
        paths.push(std::env::current_dir()?);
    }

    if args.trace {
        let sink = trace::FileSink::create(std::path::Path::new("grove-trace.log"))?;
        trace::enable(Arc::new(sink));
    }

    let driver = Arc::new(GitCli::new());
    services::services::init(driver.clone());

    let service = GitService::new();
    let mut repositories = Vec::new();
    for path in discover_repositories(&paths, recursion) {
        match service.snapshot(&path) {
            Ok(snapshot) => repositories.push(Repository::from_snapshot(&path, snapshot)),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "cannot read repository, skipping");
            }
        }
    }
    if repositories.is_empty() {
        tracing::error!("no repositories found under {} base path(s)", paths.len());
        std::process::exit(2);
    }
    tracing::info!(count = repositories.len(), %mode, "starting batch run");

    // Walk every repository through its initial state probe before
    // queueing real work.
    for repo in &repositories {
        let probe = OperationOutcome::success(Operation::StateProbe);
        if let Err(err) = repo
            .publish(EVALUATION_REQUESTED, EventPayload::Outcome(probe))
            .await
        {
            tracing::warn!(repo = %repo.name(), %err, "state probe submission failed");
        }
    }
    wait_for_quiescence(&repositories).await;

    let queue = BatchQueue::new();
    for repo in &repositories {
        queue.add(repo.clone(), mode).await;
    }
    let builder = JobBuilder::new(driver);
    let options = JobOptions {
        suppress_success: quick,
        ..JobOptions::default()
    };
    let submission_errors = queue.start_jobs_async(&builder, &options).await;
    for (repo_id, err) in &submission_errors {
        tracing::error!(%repo_id, %err, "job submission failed");
    }
    wait_for_quiescence(&repositories).await;

    let mut failed = !submission_errors.is_empty();
    for repo in &repositories {
        let status = repo.status();
        let branch = repo.current_branch();
        let clean = branch
            .as_ref()
            .map(|b| if b.clean { "clean" } else { "dirty" })
            .unwrap_or("-");
        let message = repo.message();
        println!("{:<30} {:<9} {:<6} {}", repo.name(), status, clean, message);
        if status == RepoStatus::Fail {
            failed = true;
        }
    }

    if args.trace {
        trace::disable();
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Wait until every repository's queues drained. Event chains re-enqueue
/// follow-up work before finishing, so a zero in-flight count means the
/// pipeline settled.
async fn wait_for_quiescence(repositories: &[Arc<Repository>]) {
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if repositories.iter().all(|r| r.bus().in_flight() == 0) {
            return;
        }
    }
}
