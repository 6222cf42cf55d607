//! # Swarm Runner
//!
//! Runs many instances at once, bounded by a semaphore. Each instance is its
//! own tokio task; a task that panics only loses its own result.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use super::events::{EventSink, SwarmEvent, SwarmEventKind};
use super::executor::StageExecutor;
use super::instance::{
    record_procedural_dead_end, run_instance, InstanceOutcome, ShutdownSignal,
    SwarmExperimentResult, WorktreeInfo,
};
use crate::config::CrucibleConfig;
use crate::lifecycle::{ExperimentStatus, Grade};
use crate::state::db::DB_FILE;
use crate::state::{import_instance, CrucibleDb, ExperimentManager, ImportSummary};
use crate::tools::git;

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct SwarmSummary {
    pub results: Vec<SwarmExperimentResult>,
    pub elapsed: Duration,
}

impl SwarmSummary {
    pub fn merged(&self) -> usize {
        self.results.iter().filter(|r| r.is_merged()).count()
    }

    pub fn dead_ended(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.final_status == Some(ExperimentStatus::DeadEnd))
            .count()
    }

    pub fn count(&self, outcome: InstanceOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }
}

/// Run every worktree to a stopping point, at most `max_parallel` at a time
pub async fn run_swarm(
    worktrees: Vec<WorktreeInfo>,
    executor: Arc<dyn StageExecutor>,
    config: Arc<CrucibleConfig>,
    shutdown: ShutdownSignal,
    events: EventSink,
) -> Result<SwarmSummary> {
    let started = Instant::now();
    let semaphore = Arc::new(Semaphore::new(config.swarm.max_parallel.max(1)));

    events.emit(
        SwarmEvent::new(
            SwarmEventKind::RunStarted,
            "swarm",
            format!(
                "{} instance(s), {} at a time",
                worktrees.len(),
                config.swarm.max_parallel.max(1)
            ),
        )
        .with_data(serde_json::json!({ "instances": worktrees.len() })),
    );

    let mut handles = Vec::new();

    for worktree in worktrees {
        let permit = semaphore.clone().acquire_owned().await?;
        let executor = Arc::clone(&executor);
        let config = Arc::clone(&config);
        let shutdown = shutdown.clone();
        let events = events.clone();
        let fallback = worktree.clone();

        let handle = tokio::spawn(async move {
            let _permit = permit; // Hold permit until the instance finishes
            run_instance(worktree, executor, config, shutdown, events).await
        });

        handles.push((fallback, handle));
    }

    let mut results = Vec::new();
    for (worktree, handle) in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                let message = format!("Instance task failed: {}", e);
                tracing::error!(instance = %worktree.label(), "{}", message);
                events.emit(SwarmEvent::new(
                    SwarmEventKind::StepFailed,
                    &worktree.label(),
                    &message,
                ));
                let (final_status, grade) = dead_end_abandoned(&worktree, &message);
                results.push(SwarmExperimentResult {
                    ordinal: worktree.ordinal,
                    slug: worktree.slug,
                    branch: worktree.branch,
                    final_status,
                    grade,
                    steps: 0,
                    elapsed: started.elapsed(),
                    outcome: InstanceOutcome::Failed,
                    error: Some(message),
                });
            }
        }
    }

    let summary = SwarmSummary {
        results,
        elapsed: started.elapsed(),
    };

    events.emit(
        SwarmEvent::new(
            SwarmEventKind::RunCompleted,
            "swarm",
            format!(
                "{} merged, {} dead-ended, {} failed, {} out of steps",
                summary.merged(),
                summary.dead_ended(),
                summary.count(InstanceOutcome::Failed),
                summary.count(InstanceOutcome::MaxSteps),
            ),
        )
        .with_data(serde_json::json!({
            "merged": summary.merged(),
            "dead_ended": summary.dead_ended(),
            "elapsed_ms": summary.elapsed.as_millis() as u64,
        })),
    );

    Ok(summary)
}

/// Record the dead-end for an instance whose task died without reporting.
///
/// Returns the status and grade read back from the instance database.
fn dead_end_abandoned(
    worktree: &WorktreeInfo,
    message: &str,
) -> (Option<ExperimentStatus>, Option<Grade>) {
    let recorded = CrucibleDb::open_in(&worktree.path).and_then(|db| {
        let experiment = ExperimentManager::new(&db).get_by_slug(&worktree.slug)?;
        record_procedural_dead_end(&db, experiment.id, message)?;
        let experiment = ExperimentManager::new(&db).get(experiment.id)?;
        db.close()?;
        Ok(experiment)
    });

    match recorded {
        Ok(experiment) => (Some(experiment.status), experiment.grade),
        Err(e) => {
            tracing::error!(instance = %worktree.label(), "Failed to record dead-end: {:#}", e);
            (None, None)
        }
    }
}

/// Create one worktree per hypothesis under `<runtime_dir>/worktrees`.
///
/// All or nothing: if any worktree cannot be created, the ones made so far
/// are removed along with their branches.
pub fn provision_worktrees(
    project_root: &Path,
    runtime_dir: &Path,
    hypotheses: &[String],
    sub_type: Option<&str>,
) -> Result<Vec<WorktreeInfo>> {
    let dir = git::worktrees_dir(runtime_dir);
    let total = hypotheses.len();
    let mut created: Vec<WorktreeInfo> = Vec::with_capacity(total);

    for (i, hypothesis) in hypotheses.iter().enumerate() {
        match git::create_swarm_worktree(project_root, &dir, i + 1, total, hypothesis) {
            Ok(mut info) => {
                info.sub_type = sub_type.map(str::to_string);
                created.push(info);
            }
            Err(e) => {
                for worktree in &created {
                    if let Err(err) = git::remove_swarm_worktree(project_root, worktree, false) {
                        tracing::warn!(instance = %worktree.label(), "Rollback failed: {:#}", err);
                    }
                }
                return Err(e.context(format!(
                    "Failed to provision worktree {} of {}",
                    i + 1,
                    total
                )));
            }
        }
    }

    Ok(created)
}

/// Copy one instance's records into the project database
pub fn archive_instance(
    project_db: &CrucibleDb,
    worktree: &WorktreeInfo,
) -> Result<ImportSummary> {
    let path = worktree.path.join(".crucible").join(DB_FILE);
    if !path.exists() {
        return Ok(ImportSummary::default());
    }

    let instance_db = CrucibleDb::open_at(&path)?;
    let summary = import_instance(project_db, &instance_db)
        .with_context(|| format!("Failed to archive instance {}", worktree.label()))?;
    instance_db.close()?;

    tracing::info!(
        instance = %worktree.label(),
        experiments = summary.experiments.len(),
        dead_ends = summary.dead_ends,
        "Instance archived"
    );
    Ok(summary)
}

/// Archive every instance, then remove its worktree.
///
/// A worktree whose archive fails is left on disk. The branch of an
/// instance that merged is kept. Errors are logged, never returned.
pub fn cleanup_worktrees(
    project_root: &Path,
    project_db: &CrucibleDb,
    worktrees: &[WorktreeInfo],
) {
    for worktree in worktrees {
        let summary = match archive_instance(project_db, worktree) {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(
                    instance = %worktree.label(),
                    path = ?worktree.path,
                    "Keeping worktree: {:#}",
                    e
                );
                continue;
            }
        };

        if let Err(e) = git::remove_swarm_worktree(project_root, worktree, summary.merged) {
            tracing::warn!(instance = %worktree.label(), "Failed to remove worktree: {:#}", e);
        }
    }
}
