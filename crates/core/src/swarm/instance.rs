//! # Swarm Instance
//!
//! Drives one experiment through its lifecycle inside its own worktree and
//! its own database. Failures stay inside the instance: a failing stage
//! becomes a dead-end, never an error for the caller.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::events::{EventSink, SwarmEvent, SwarmEventKind};
use super::executor::{Stage, StageContext, StageExecutor};
use super::resolve::{resolve_db_only, Resolution};
use crate::config::CrucibleConfig;
use crate::lifecycle::{
    determine_next_step, is_terminal, valid_next, AdminReason, ExperimentStatus, Grade,
};
use crate::metrics::{capture_metrics, MetricPhase};
use crate::state::io::seed_experiment_log;
use crate::state::{
    CrucibleDb, DeadEndCategory, DeadEndManager, Experiment, ExperimentManager, FindingManager,
    MetricManager, NewDeadEnd, NewExperiment,
};

/// Process-wide cooperative stop flag, polled between steps
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Isolated working copy assigned to one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    /// Zero-padded position in the run ("01")
    pub ordinal: String,
    pub branch: String,
    pub slug: String,
    pub hypothesis: String,
    #[serde(default)]
    pub sub_type: Option<String>,
}

impl WorktreeInfo {
    /// `<ordinal>-<slug>`, used to label events and logs
    pub fn label(&self) -> String {
        format!("{}-{}", self.ordinal, self.slug)
    }
}

/// Why an instance stopped
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceOutcome {
    /// Reached `merged` or `dead_end` through the lifecycle
    Terminal,
    /// Step budget used up
    MaxSteps,
    /// Shutdown observed between steps
    Shutdown,
    /// Status offered no successor
    NoSuccessors,
    /// Setup or a stage failed
    Failed,
}

/// Result of one instance
#[derive(Debug, Clone, Serialize)]
pub struct SwarmExperimentResult {
    pub ordinal: String,
    pub slug: String,
    pub branch: String,
    pub final_status: Option<ExperimentStatus>,
    pub grade: Option<Grade>,
    pub steps: u32,
    pub elapsed: Duration,
    pub outcome: InstanceOutcome,
    pub error: Option<String>,
}

impl SwarmExperimentResult {
    fn failed_setup(worktree: &WorktreeInfo, started: Instant, error: String) -> Self {
        Self {
            ordinal: worktree.ordinal.clone(),
            slug: worktree.slug.clone(),
            branch: worktree.branch.clone(),
            final_status: None,
            grade: None,
            steps: 0,
            elapsed: started.elapsed(),
            outcome: InstanceOutcome::Failed,
            error: Some(error),
        }
    }

    pub fn is_merged(&self) -> bool {
        self.final_status == Some(ExperimentStatus::Merged)
    }
}

/// What a single step did
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Already terminal; nothing done
    Terminal(ExperimentStatus),
    /// Status has no successors; nothing done
    NoSuccessors(ExperimentStatus),
    /// A step ran; `to` is the status read back afterwards
    Advanced {
        from: ExperimentStatus,
        to: ExperimentStatus,
        next: ExperimentStatus,
        resolution: Option<Resolution>,
    },
}

/// Run exactly one lifecycle step for experiment `id`.
///
/// Reads the persisted status, asks the policy for the next status, and
/// dispatches: `resolved` grades in the database, `compressed` runs the
/// compress stage and persists, `merged`/`reframed` just persist, anything
/// else goes to the executor. Verification opens a new grading round and
/// builds capture metrics when a metrics command is configured.
pub async fn step_once(
    db: &CrucibleDb,
    id: i64,
    worktree: &WorktreeInfo,
    executor: &dyn StageExecutor,
    config: &CrucibleConfig,
    step: u32,
) -> Result<StepOutcome> {
    let experiments = ExperimentManager::new(db);
    let experiment = experiments.get(id)?;
    let from = experiment.status;

    if is_terminal(from) {
        return Ok(StepOutcome::Terminal(from));
    }
    let valid = valid_next(from);
    if valid.is_empty() {
        return Ok(StepOutcome::NoSuccessors(from));
    }

    let findings = FindingManager::new(db);
    let has_doubts = findings.has_doubts(id)? || !config.cycle.require_doubt_before_verify;
    let has_challenges =
        findings.has_challenges(id)? || !config.cycle.require_challenge_before_verify;
    let next = determine_next_step(&experiment, valid, has_doubts, has_challenges)?;
    tracing::debug!(id, %from, %next, step, "Next step resolved");

    let mut resolution = None;
    match next {
        ExperimentStatus::Resolved => {
            resolution = Some(resolve_db_only(db, id, config)?);
        }
        ExperimentStatus::Compressed => {
            run_stage(executor, Stage::Compress, experiment, worktree, db, config, step).await?;
            experiments.transition(id, ExperimentStatus::Compressed)?;
        }
        ExperimentStatus::Merged | ExperimentStatus::Reframed | ExperimentStatus::DeadEnd => {
            experiments.transition(id, next)?;
        }
        other => {
            let stage = Stage::for_status(other)
                .ok_or_else(|| anyhow::anyhow!("No stage leads to status '{}'", other))?;
            match stage {
                Stage::Build => {
                    build_with_metrics(executor, experiment, worktree, db, config, step).await?;
                }
                Stage::Verify => {
                    findings.begin_verification(id)?;
                    run_stage(executor, stage, experiment, worktree, db, config, step).await?;
                }
                _ => run_stage(executor, stage, experiment, worktree, db, config, step).await?,
            }
        }
    }

    let to = experiments.get(id)?.status;
    Ok(StepOutcome::Advanced {
        from,
        to,
        next,
        resolution,
    })
}

/// Run the build stage bracketed by metric captures.
///
/// The baseline is taken once, before the first build; every build
/// refreshes the `after` snapshot. Without a metrics command this is a
/// plain build.
async fn build_with_metrics(
    executor: &dyn StageExecutor,
    experiment: Experiment,
    worktree: &WorktreeInfo,
    db: &CrucibleDb,
    config: &CrucibleConfig,
    step: u32,
) -> Result<()> {
    let Some(command) = config.metrics.command.as_deref() else {
        return run_stage(executor, Stage::Build, experiment, worktree, db, config, step).await;
    };
    let id = experiment.id;

    let has_baseline = MetricManager::new(db)
        .for_experiment(id)?
        .iter()
        .any(|s| s.phase == MetricPhase::Before);
    if !has_baseline {
        capture_metrics(db, id, MetricPhase::Before, command, &worktree.path)
            .await
            .context("Baseline metrics capture failed")?;
    }

    run_stage(executor, Stage::Build, experiment, worktree, db, config, step).await?;

    capture_metrics(db, id, MetricPhase::After, command, &worktree.path)
        .await
        .context("Post-build metrics capture failed")?;
    Ok(())
}

async fn run_stage(
    executor: &dyn StageExecutor,
    stage: Stage,
    experiment: Experiment,
    worktree: &WorktreeInfo,
    db: &CrucibleDb,
    config: &CrucibleConfig,
    step: u32,
) -> Result<()> {
    let ctx = StageContext {
        experiment,
        worktree,
        db,
        config,
        step,
    };
    executor
        .run_stage(stage, &ctx)
        .await
        .with_context(|| format!("Stage '{}' failed", stage))
}

/// Drive one experiment from creation to a stopping point
pub async fn run_instance(
    worktree: WorktreeInfo,
    executor: Arc<dyn StageExecutor>,
    config: Arc<CrucibleConfig>,
    shutdown: ShutdownSignal,
    events: EventSink,
) -> SwarmExperimentResult {
    let started = Instant::now();
    let label = worktree.label();

    let db = match CrucibleDb::open_in(&worktree.path) {
        Ok(db) => db,
        Err(e) => {
            let message = format!("{:#}", e);
            events.emit(SwarmEvent::new(SwarmEventKind::StepFailed, &label, &message));
            return SwarmExperimentResult::failed_setup(&worktree, started, message);
        }
    };

    let experiment = match initialize(&db, &worktree).await {
        Ok(experiment) => experiment,
        Err(e) => {
            let message = format!("{:#}", e);
            events.emit(SwarmEvent::new(SwarmEventKind::StepFailed, &label, &message));
            release(db, &label);
            return SwarmExperimentResult::failed_setup(&worktree, started, message);
        }
    };

    events.emit(
        SwarmEvent::new(SwarmEventKind::InstanceStarted, &label, &worktree.hypothesis)
            .with_data(serde_json::json!({ "branch": worktree.branch, "experiment_id": experiment.id })),
    );

    let (steps, outcome, error) = drive(
        &db,
        experiment.id,
        &worktree,
        executor.as_ref(),
        &config,
        &shutdown,
        &events,
        &label,
    )
    .await;

    let (final_status, grade) = match ExperimentManager::new(&db).get(experiment.id) {
        Ok(exp) => (Some(exp.status), exp.grade),
        Err(e) => {
            tracing::warn!(instance = %label, "Could not read final status: {:#}", e);
            (None, None)
        }
    };
    release(db, &label);

    let result = SwarmExperimentResult {
        ordinal: worktree.ordinal.clone(),
        slug: worktree.slug.clone(),
        branch: worktree.branch.clone(),
        final_status,
        grade,
        steps,
        elapsed: started.elapsed(),
        outcome,
        error,
    };

    events.emit(
        SwarmEvent::new(
            SwarmEventKind::InstanceFinished,
            &label,
            format!(
                "{:?} after {} step(s), status {}",
                result.outcome,
                result.steps,
                result
                    .final_status
                    .map(|s| s.as_str())
                    .unwrap_or("unknown")
            ),
        )
        .with_data(serde_json::json!({
            "outcome": result.outcome,
            "status": result.final_status,
            "grade": result.grade,
            "steps": result.steps,
        })),
    );

    result
}

async fn initialize(db: &CrucibleDb, worktree: &WorktreeInfo) -> Result<Experiment> {
    let mut new = NewExperiment::new(&worktree.slug, &worktree.hypothesis)
        .with_branch(&worktree.branch)
        .starting_at(ExperimentStatus::Reframed);
    if let Some(sub_type) = &worktree.sub_type {
        new = new.with_sub_type(sub_type);
    }
    let experiment = ExperimentManager::new(db).create(&new)?;

    seed_experiment_log(
        &worktree.path,
        &worktree.ordinal,
        &worktree.slug,
        &worktree.hypothesis,
        &worktree.branch,
    )
    .await?;

    Ok(experiment)
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    db: &CrucibleDb,
    id: i64,
    worktree: &WorktreeInfo,
    executor: &dyn StageExecutor,
    config: &CrucibleConfig,
    shutdown: &ShutdownSignal,
    events: &EventSink,
    label: &str,
) -> (u32, InstanceOutcome, Option<String>) {
    let max_steps = config.swarm.max_steps;
    let mut steps = 0u32;

    loop {
        if shutdown.is_requested() {
            events.emit(SwarmEvent::new(
                SwarmEventKind::ShutdownObserved,
                label,
                format!("Stopping after {} step(s)", steps),
            ));
            return (steps, InstanceOutcome::Shutdown, None);
        }

        match ExperimentManager::new(db).get(id) {
            Ok(exp) if is_terminal(exp.status) => {
                return (steps, InstanceOutcome::Terminal, None);
            }
            Ok(_) => {}
            Err(e) => return contain_failure(db, id, events, label, steps, e),
        }

        if steps >= max_steps {
            events.emit(SwarmEvent::new(
                SwarmEventKind::MaxStepsReached,
                label,
                format!("Step budget of {} exhausted", max_steps),
            ));
            return (steps, InstanceOutcome::MaxSteps, None);
        }
        steps += 1;

        match step_once(db, id, worktree, executor, config, steps).await {
            Ok(StepOutcome::Terminal(_)) => return (steps, InstanceOutcome::Terminal, None),
            Ok(StepOutcome::NoSuccessors(status)) => {
                tracing::warn!(instance = %label, %status, "No successors");
                return (steps, InstanceOutcome::NoSuccessors, None);
            }
            Ok(StepOutcome::Advanced {
                from,
                to,
                next,
                resolution,
            }) => {
                if let Some(resolution) = &resolution {
                    report_resolution(resolution, events, label);
                }
                events.emit(
                    SwarmEvent::new(
                        SwarmEventKind::StepCompleted,
                        label,
                        format!("{} -> {}", from, to),
                    )
                    .with_data(serde_json::json!({
                        "step": steps,
                        "from": from,
                        "next": next,
                        "to": to,
                    })),
                );
            }
            Err(e) => return contain_failure(db, id, events, label, steps, e),
        }
    }
}

fn report_resolution(resolution: &Resolution, events: &EventSink, label: &str) {
    if !resolution.violations.is_empty() {
        let fixtures: Vec<&str> = resolution
            .violations
            .iter()
            .map(|v| v.fixture.as_str())
            .collect();
        events.emit(
            SwarmEvent::new(
                SwarmEventKind::GateViolation,
                label,
                format!("Gate regressions on {}", fixtures.join(", ")),
            )
            .with_data(serde_json::json!(resolution.violations)),
        );
    }
    if let Some(breaker) = &resolution.circuit_breaker {
        events.emit(SwarmEvent::new(
            SwarmEventKind::CircuitBreakerTripped,
            label,
            format!(
                "Sub-type '{}' has {} dead-ends (threshold {})",
                breaker.sub_type, breaker.count, breaker.threshold
            ),
        ));
    }
}

/// Record a procedural dead-end and force the experiment to `dead_end`
fn contain_failure(
    db: &CrucibleDb,
    id: i64,
    events: &EventSink,
    label: &str,
    steps: u32,
    error: anyhow::Error,
) -> (u32, InstanceOutcome, Option<String>) {
    let message = format!("{:#}", error);
    events.emit(SwarmEvent::new(SwarmEventKind::StepFailed, label, &message));

    if let Err(e) = record_procedural_dead_end(db, id, &message) {
        tracing::error!(instance = %label, "Failed to record dead-end: {:#}", e);
    }
    (steps, InstanceOutcome::Failed, Some(message))
}

pub(crate) fn record_procedural_dead_end(db: &CrucibleDb, id: i64, message: &str) -> Result<()> {
    let experiments = ExperimentManager::new(db);
    let experiment = experiments.get(id)?;
    if is_terminal(experiment.status) {
        return Ok(());
    }

    DeadEndManager::new(db).record(&NewDeadEnd {
        experiment_id: Some(id),
        approach: message.to_string(),
        structural_constraint: message.to_string(),
        sub_type: experiment.sub_type.clone(),
        category: DeadEndCategory::Procedural,
    })?;
    experiments.admin_transition(id, ExperimentStatus::DeadEnd, AdminReason::ErrorRecovery)?;
    Ok(())
}

fn release(db: CrucibleDb, label: &str) {
    if let Err(e) = db.close() {
        tracing::warn!(instance = %label, "Failed to close database: {:#}", e);
    }
}
