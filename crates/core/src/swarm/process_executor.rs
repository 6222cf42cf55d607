//! # Process Stage Executor
//!
//! Runs the configured worker command for each stage, pipes its stdout
//! through the extraction pipeline and persists what it finds.
//!
//! The worker sees the stage through environment variables:
//! `CRUCIBLE_STAGE`, `CRUCIBLE_ROLE`, `CRUCIBLE_EXPERIMENT_ID`,
//! `CRUCIBLE_SLUG`, `CRUCIBLE_HYPOTHESIS`, `CRUCIBLE_BRANCH`, and
//! `CRUCIBLE_RUNTIME_PATH` (the worktree's own `.crucible`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;

use super::executor::{Stage, StageContext, StageExecutor};
use crate::config::CrucibleConfig;
use crate::extraction::{ExtractionPipeline, Interpreter, LlmInterpreter, StructuredOutput};
use crate::lifecycle::{AdminReason, ExperimentStatus};
use crate::state::{
    DeadEndCategory, DeadEndManager, ExperimentManager, FindingManager, NewDeadEnd,
};

/// Longest challenge recorded from raw output
const MAX_CHALLENGE_LEN: usize = 2_000;

pub struct ProcessStageExecutor {
    command: Vec<String>,
    pipeline: ExtractionPipeline,
}

impl ProcessStageExecutor {
    pub fn new(command: Vec<String>, pipeline: ExtractionPipeline) -> Result<Self> {
        if command.is_empty() {
            anyhow::bail!("No worker command configured (worker.command is empty)");
        }
        Ok(Self { command, pipeline })
    }

    /// Worker command from config; the LLM fallback tier is added when its API key is set
    pub fn from_config(config: &CrucibleConfig) -> Result<Self> {
        let interpreter = LlmInterpreter::from_env(config.interpreter.clone())
            .map(|i| Arc::new(i) as Arc<dyn Interpreter>);
        Self::new(
            config.worker.command.clone(),
            ExtractionPipeline::standard(interpreter),
        )
    }

    async fn run_worker(&self, stage: Stage, ctx: &StageContext<'_>) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("No worker command configured"))?;
        let experiment = &ctx.experiment;

        let output = Command::new(program)
            .args(args)
            .current_dir(&ctx.worktree.path)
            .env("CRUCIBLE_STAGE", stage.as_str())
            .env("CRUCIBLE_ROLE", stage.role().as_str())
            .env("CRUCIBLE_EXPERIMENT_ID", experiment.id.to_string())
            .env("CRUCIBLE_SLUG", &experiment.slug)
            .env("CRUCIBLE_HYPOTHESIS", &experiment.hypothesis)
            .env("CRUCIBLE_BRANCH", &experiment.branch)
            .env("CRUCIBLE_RUNTIME_PATH", ctx.worktree.path.join(".crucible"))
            .output()
            .await
            .with_context(|| format!("Failed to spawn worker: {}", program))?;

        if !output.status.success() {
            anyhow::bail!(
                "Worker exited with {} during {}: {}",
                output.status,
                stage,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn extract(&self, stage: Stage, text: &str) -> Option<StructuredOutput> {
        let extraction = self.pipeline.extract(stage.role(), text).await;
        tracing::debug!(%stage, tier = extraction.tier.number(), "Worker output extracted");
        extraction.output
    }
}

#[async_trait]
impl StageExecutor for ProcessStageExecutor {
    async fn run_stage(&self, stage: Stage, ctx: &StageContext<'_>) -> Result<()> {
        let experiments = ExperimentManager::new(ctx.db);
        let findings = FindingManager::new(ctx.db);
        let id = ctx.experiment.id;

        if stage == Stage::Build && ctx.experiment.status != ExperimentStatus::Building {
            experiments.transition(id, ExperimentStatus::Building)?;
        }
        if stage == Stage::Verify && ctx.experiment.status != ExperimentStatus::Verifying {
            experiments.transition(id, ExperimentStatus::Verifying)?;
        }

        let text = self.run_worker(stage, ctx).await?;
        let mut output = self.extract(stage, &text).await.unwrap_or_default();

        if stage == Stage::Challenge {
            let mut challenges: Vec<String> =
                output.doubts.drain(..).map(|d| d.description).collect();
            if challenges.is_empty() {
                let raw: String = text.trim().chars().take(MAX_CHALLENGE_LEN).collect();
                if !raw.is_empty() {
                    challenges.push(raw);
                }
            }
            for challenge in &challenges {
                findings.add_challenge(id, challenge)?;
            }
        }

        findings.record_output(id, &output)?;

        if let Some(abandon) = output.abandon.take() {
            tracing::warn!(id, reason = %abandon.reason, "Builder abandoned the hypothesis");
            DeadEndManager::new(ctx.db).record(&NewDeadEnd {
                experiment_id: Some(id),
                approach: abandon.reason,
                structural_constraint: abandon.structural_constraint,
                sub_type: ctx.experiment.sub_type.clone(),
                category: DeadEndCategory::Structural,
            })?;
            experiments.admin_transition(id, ExperimentStatus::DeadEnd, AdminReason::Revert)?;
            return Ok(());
        }

        let target = match stage {
            Stage::Gate => Some(ExperimentStatus::Gated),
            Stage::Build => Some(ExperimentStatus::Built),
            Stage::Challenge => Some(ExperimentStatus::Challenged),
            Stage::Doubt => Some(ExperimentStatus::Doubted),
            Stage::Scout => Some(ExperimentStatus::Scouted),
            Stage::Verify => Some(ExperimentStatus::Verified),
            Stage::Compress => None,
        };
        if let Some(target) = target {
            experiments.transition(id, target)?;
        }
        Ok(())
    }
}
