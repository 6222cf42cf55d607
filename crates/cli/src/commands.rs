//! Subcommand handlers. Each one opens what it needs, does one thing and
//! prints a short report.

use anyhow::{Context, Result};
use crucible_core::config::CrucibleConfig;
use crucible_core::lifecycle::{is_terminal, valid_next, AdminReason, ExperimentStatus};
use crucible_core::metrics::{capture_metrics, check_gate_violations, compare_metrics, MetricPhase};
use crucible_core::state::io::{ensure_runtime_dir, get_runtime_path, seed_experiment_log};
use crucible_core::state::{
    CrucibleDb, DeadEndCategory, DeadEndManager, Experiment, ExperimentManager, MetricManager,
    NewDeadEnd, NewExperiment, SessionManager, SessionNotes,
};
use crucible_core::swarm::{
    archive_instance, cleanup_worktrees, provision_worktrees, run_swarm, step_once, EventSink,
    ProcessStageExecutor, ShutdownSignal, StepOutcome, SwarmEvent, WorktreeInfo,
};
use crucible_core::tools::git;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct NewArgs {
    pub slug: String,
    pub hypothesis: String,
    pub sub_type: Option<String>,
    pub branch: Option<String>,
    pub parent: Option<String>,
    pub create_branch: bool,
}

fn project_root() -> Result<PathBuf> {
    std::env::current_dir().context("Failed to read current directory")
}

async fn load_config() -> Result<CrucibleConfig> {
    CrucibleConfig::load(&get_runtime_path()).await
}

/// `slug` if given, otherwise the most recently created experiment
fn find_experiment(db: &CrucibleDb, slug: Option<&str>) -> Result<Experiment> {
    let experiments = ExperimentManager::new(db);
    match slug {
        Some(slug) => experiments.get_by_slug(slug),
        None => experiments
            .latest()?
            .ok_or_else(|| anyhow::anyhow!("No experiments yet; start one with `crucible new`")),
    }
}

pub async fn init() -> Result<()> {
    let runtime = ensure_runtime_dir().await?;
    let config_path = CrucibleConfig::path_in(&runtime);
    if config_path.exists() {
        println!("Config already present at {}", config_path.display());
    } else {
        CrucibleConfig::default().save(&runtime).await?;
        println!("Wrote default config to {}", config_path.display());
    }
    CrucibleDb::open()?.close()?;
    println!("Initialized {}", runtime.display());
    Ok(())
}

pub async fn new_experiment(args: NewArgs) -> Result<()> {
    ensure_runtime_dir().await?;
    let config = load_config().await?;
    let db = CrucibleDb::open()?;
    let experiments = ExperimentManager::new(&db);

    if let Some(sub_type) = &args.sub_type {
        let breaker = DeadEndManager::new(&db)
            .circuit_breaker(sub_type, config.cycle.circuit_breaker_threshold)?;
        if breaker.tripped {
            tracing::warn!(
                sub_type = %sub_type,
                count = breaker.count,
                threshold = breaker.threshold,
                "Circuit breaker tripped for this sub-type; consider a different approach"
            );
        }
    }

    let mut new = NewExperiment::new(&args.slug, &args.hypothesis);
    if let Some(branch) = &args.branch {
        new = new.with_branch(branch);
    }
    if let Some(sub_type) = &args.sub_type {
        new = new.with_sub_type(sub_type);
    }
    if let Some(parent) = &args.parent {
        new = new.with_parent(experiments.get_by_slug(parent)?.id);
    }

    let root = project_root()?;
    if args.create_branch {
        git::create_branch(&root, &new.branch)?;
    }

    let experiment = experiments.create(&new)?;
    let ordinal = format!("{:02}", experiment.id);
    let log = seed_experiment_log(
        &root,
        &ordinal,
        &experiment.slug,
        &experiment.hypothesis,
        &experiment.branch,
    )
    .await?;

    println!(
        "Created experiment #{} '{}' on {} ({})",
        experiment.id, experiment.slug, experiment.branch, experiment.status
    );
    println!("Log: {}", log.display());
    db.close()
}

pub async fn next(slug: Option<&str>) -> Result<()> {
    let config = load_config().await?;
    let executor = ProcessStageExecutor::from_config(&config)?;
    let db = CrucibleDb::open()?;
    let experiment = find_experiment(&db, slug)?;

    let worktree = WorktreeInfo {
        path: project_root()?,
        ordinal: format!("{:02}", experiment.id),
        branch: experiment.branch.clone(),
        slug: experiment.slug.clone(),
        hypothesis: experiment.hypothesis.clone(),
        sub_type: experiment.sub_type.clone(),
    };

    let outcome = step_once(&db, experiment.id, &worktree, &executor, &config, 1).await?;
    match outcome {
        StepOutcome::Terminal(status) => {
            println!("'{}' is already {}; nothing to do", experiment.slug, status)
        }
        StepOutcome::NoSuccessors(status) => {
            println!("'{}' has no successors from {}", experiment.slug, status)
        }
        StepOutcome::Advanced {
            from,
            to,
            next,
            resolution,
        } => {
            println!("'{}': {} -> {} (now {})", experiment.slug, from, next, to);
            if let Some(resolution) = resolution {
                println!("Graded {}", resolution.grade);
                for violation in &resolution.violations {
                    println!(
                        "  gate violation: {}/{} {} -> {}",
                        violation.fixture, violation.metric, violation.before, violation.after
                    );
                }
                if let Some(breaker) = resolution.circuit_breaker {
                    tracing::warn!(
                        sub_type = %breaker.sub_type,
                        count = breaker.count,
                        "Circuit breaker tripped"
                    );
                }
            }
        }
    }
    db.close()
}

pub fn status(slug: Option<&str>, json: bool) -> Result<()> {
    let db = CrucibleDb::open()?;
    let experiments = ExperimentManager::new(&db);
    let listed = match slug {
        Some(slug) => vec![experiments.get_by_slug(slug)?],
        None => experiments.list_all()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&listed)?);
        return db.close();
    }

    if listed.is_empty() {
        println!("No experiments");
    }
    for experiment in &listed {
        let next: Vec<&str> = valid_next(experiment.status)
            .iter()
            .map(ExperimentStatus::as_str)
            .collect();
        println!(
            "#{:<3} {:<28} {:<11} grade={:<8} next=[{}]",
            experiment.id,
            experiment.slug,
            experiment.status.as_str(),
            experiment.grade.map(|g| g.as_str()).unwrap_or("-"),
            next.join(", ")
        );
    }

    if let Some(session) = SessionManager::new(&db).active()? {
        println!("Active session #{}: {}", session.id, session.intent);
    }
    db.close()
}

pub async fn revert(slug: &str, reason: &str) -> Result<()> {
    let db = CrucibleDb::open()?;
    let experiments = ExperimentManager::new(&db);
    let experiment = experiments.get_by_slug(slug)?;

    experiments.admin_transition(experiment.id, ExperimentStatus::DeadEnd, AdminReason::Revert)?;
    DeadEndManager::new(&db).record(&NewDeadEnd {
        experiment_id: Some(experiment.id),
        approach: experiment.hypothesis.clone(),
        structural_constraint: reason.to_string(),
        sub_type: experiment.sub_type.clone(),
        category: DeadEndCategory::Structural,
    })?;

    println!("Reverted '{}' ({} -> dead_end)", slug, experiment.status);
    db.close()
}

pub fn session_start(intent: &str) -> Result<()> {
    let db = CrucibleDb::open()?;
    let experiment_id = ExperimentManager::new(&db)
        .latest()?
        .filter(|e| !is_terminal(e.status))
        .map(|e| e.id);
    let session = SessionManager::new(&db).start(intent, experiment_id)?;
    println!("Started session #{}: {}", session.id, session.intent);
    db.close()
}

pub fn session_end(
    accomplished: Option<String>,
    unfinished: Option<String>,
    new_fragility: Option<String>,
) -> Result<()> {
    let db = CrucibleDb::open()?;
    let session = SessionManager::new(&db).end(&SessionNotes {
        accomplished,
        unfinished,
        new_fragility,
    })?;
    println!("Ended session #{}: {}", session.id, session.intent);
    db.close()
}

pub fn session_show() -> Result<()> {
    let db = CrucibleDb::open()?;
    let sessions = SessionManager::new(&db).recent(10)?;
    if sessions.is_empty() {
        println!("No sessions");
    }
    for session in &sessions {
        let state = if session.is_open() { "open" } else { "closed" };
        println!(
            "#{:<3} {:<6} {} {}",
            session.id,
            state,
            session.started_at.format("%Y-%m-%d %H:%M"),
            session.intent
        );
        if let Some(unfinished) = &session.unfinished {
            println!("      unfinished: {}", unfinished);
        }
        if let Some(fragility) = &session.new_fragility {
            println!("      fragility: {}", fragility);
        }
    }
    db.close()
}

pub async fn metrics_capture(phase: MetricPhase, slug: Option<&str>) -> Result<()> {
    let config = load_config().await?;
    let command = config
        .metrics
        .command
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("No metrics.command configured"))?;
    let db = CrucibleDb::open()?;
    let experiment = find_experiment(&db, slug)?;

    let snapshots = capture_metrics(&db, experiment.id, phase, command, &project_root()?).await?;
    println!(
        "Captured {} {} snapshot(s) for '{}'",
        snapshots.len(),
        phase,
        experiment.slug
    );
    db.close()
}

pub async fn metrics_compare(slug: Option<&str>) -> Result<()> {
    let config = load_config().await?;
    let db = CrucibleDb::open()?;
    let experiment = find_experiment(&db, slug)?;

    let snapshots = MetricManager::new(&db).for_experiment(experiment.id)?;
    let comparisons = compare_metrics(&snapshots, &config.metrics);
    for c in &comparisons {
        let flag = match (c.regression, c.gate) {
            (true, true) => "GATE",
            (true, false) => "regressed",
            _ => "ok",
        };
        println!(
            "{:<20} {:<20} {:>12.4} -> {:<12.4} ({:+.4}) {}",
            c.fixture, c.metric, c.before, c.after, c.delta, flag
        );
    }

    let violations = check_gate_violations(&comparisons);
    db.close()?;
    if !violations.is_empty() {
        anyhow::bail!("{} gate violation(s)", violations.len());
    }
    Ok(())
}

pub fn dead_ends(sub_type: Option<&str>) -> Result<()> {
    let db = CrucibleDb::open()?;
    let dead_ends = DeadEndManager::new(&db).list(sub_type)?;
    if dead_ends.is_empty() {
        println!("No dead-ends");
    }
    for dead_end in &dead_ends {
        println!(
            "#{:<3} [{:?}] {} :: {}{}",
            dead_end.id,
            dead_end.category,
            dead_end.approach,
            dead_end.structural_constraint,
            dead_end
                .sub_type
                .as_deref()
                .map(|s| format!(" ({})", s))
                .unwrap_or_default()
        );
    }
    db.close()
}

#[derive(Debug, PartialEq, Eq)]
enum InterruptAction {
    /// Let running instances finish their current step
    Drain,
    /// Leave immediately
    Exit,
}

/// The first interrupt asks instances to stop; any later one exits
fn interrupt_action(count: u32, shutdown: &ShutdownSignal) -> InterruptAction {
    if count <= 1 {
        shutdown.request();
        InterruptAction::Drain
    } else {
        InterruptAction::Exit
    }
}

pub async fn swarm(
    hypotheses: Vec<String>,
    sub_type: Option<String>,
    max_parallel: Option<usize>,
    keep_worktrees: bool,
) -> Result<()> {
    let runtime = ensure_runtime_dir().await?;
    let mut config = load_config().await?;
    if let Some(n) = max_parallel {
        config.swarm.max_parallel = n;
    }
    config.swarm.keep_worktrees |= keep_worktrees;

    let executor = Arc::new(ProcessStageExecutor::from_config(&config)?);
    let root = project_root()?;
    let worktrees = provision_worktrees(&root, &runtime, &hypotheses, sub_type.as_deref())?;

    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let mut count = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            count += 1;
            match interrupt_action(count, &signal) {
                InterruptAction::Drain => tracing::warn!(
                    "Interrupt received; instances stop after their current step (again to exit now)"
                ),
                InterruptAction::Exit => {
                    tracing::warn!("Second interrupt; exiting without waiting for instances");
                    std::process::exit(130);
                }
            }
        }
    });

    let (tx, mut rx) = mpsc::channel::<SwarmEvent>(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("[{}] {:?}: {}", event.instance, event.kind, event.message);
        }
    });

    let keep = config.swarm.keep_worktrees;
    let result = run_swarm(
        worktrees.clone(),
        executor,
        Arc::new(config),
        shutdown,
        EventSink::new(tx),
    )
    .await;
    printer.await.ok();

    let project_db = CrucibleDb::open()?;
    if keep {
        for worktree in &worktrees {
            if let Err(e) = archive_instance(&project_db, worktree) {
                tracing::warn!(instance = %worktree.label(), "{:#}", e);
            }
        }
    } else {
        cleanup_worktrees(&root, &project_db, &worktrees);
    }
    project_db.close()?;

    let summary = result?;
    println!();
    for r in &summary.results {
        println!(
            "{}-{:<32} {:<11} grade={:<8} steps={:<3} {:?}{}",
            r.ordinal,
            r.slug,
            r.final_status.map(|s| s.as_str()).unwrap_or("?"),
            r.grade.map(|g| g.as_str()).unwrap_or("-"),
            r.steps,
            r.outcome,
            r.error
                .as_deref()
                .map(|e| format!(" error: {}", e))
                .unwrap_or_default()
        );
    }
    println!(
        "{} merged, {} dead-ended of {} in {:.1}s",
        summary.merged(),
        summary.dead_ended(),
        summary.results.len(),
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}
