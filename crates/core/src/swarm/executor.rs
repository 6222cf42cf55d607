//! # Stage Executors
//!
//! The seam between the lifecycle loop and whatever does the actual work.
//! An executor either fails or leaves the experiment in the status its stage
//! produces; the loop only looks at the persisted status afterwards.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::instance::WorktreeInfo;
use crate::config::CrucibleConfig;
use crate::extraction::WorkerRole;
use crate::lifecycle::ExperimentStatus;
use crate::state::{CrucibleDb, Experiment};

/// Named unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Gate,
    Build,
    Challenge,
    Doubt,
    Scout,
    Verify,
    Compress,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gate => "gate",
            Self::Build => "build",
            Self::Challenge => "challenge",
            Self::Doubt => "doubt",
            Self::Scout => "scout",
            Self::Verify => "verify",
            Self::Compress => "compress",
        }
    }

    /// Worker role whose output this stage produces
    pub fn role(&self) -> WorkerRole {
        match self {
            Self::Gate => WorkerRole::Gatekeeper,
            Self::Build => WorkerRole::Builder,
            Self::Challenge => WorkerRole::Adversary,
            Self::Doubt => WorkerRole::Critic,
            Self::Scout => WorkerRole::Scout,
            Self::Verify => WorkerRole::Verifier,
            Self::Compress => WorkerRole::Compressor,
        }
    }

    /// Stage that moves an experiment into `next`.
    ///
    /// `resolved`, `compressed`, `merged` and `reframed` are handled by the
    /// loop itself and have no stage here.
    pub fn for_status(next: ExperimentStatus) -> Option<Self> {
        use ExperimentStatus::*;
        match next {
            Gated => Some(Self::Gate),
            Building | Built => Some(Self::Build),
            Challenged => Some(Self::Challenge),
            Doubted => Some(Self::Doubt),
            Scouted => Some(Self::Scout),
            Verifying | Verified => Some(Self::Verify),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stage gets to work with
pub struct StageContext<'a> {
    /// Snapshot taken right before the stage started
    pub experiment: Experiment,
    pub worktree: &'a WorktreeInfo,
    pub db: &'a CrucibleDb,
    pub config: &'a CrucibleConfig,
    /// 1-based step number within the instance
    pub step: u32,
}

/// Performs one stage for one experiment
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Fail, or persist the status the stage leads to
    async fn run_stage(&self, stage: Stage, ctx: &StageContext<'_>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::valid_next;
    use ExperimentStatus::*;

    #[test]
    fn test_stage_mapping() {
        assert_eq!(Stage::for_status(Gated), Some(Stage::Gate));
        assert_eq!(Stage::for_status(Building), Some(Stage::Build));
        assert_eq!(Stage::for_status(Doubted), Some(Stage::Doubt));
        assert_eq!(Stage::for_status(Verifying), Some(Stage::Verify));
        assert_eq!(Stage::for_status(Resolved), None);
        assert_eq!(Stage::for_status(Merged), None);
    }

    #[test]
    fn test_only_builders_build() {
        assert_eq!(Stage::Build.role(), WorkerRole::Builder);
        assert_ne!(Stage::Challenge.role(), WorkerRole::Builder);
    }

    #[test]
    fn test_every_reachable_status_is_handled() {
        let handled_by_loop = [Resolved, Compressed, Merged, Reframed, DeadEnd];
        for status in ExperimentStatus::ALL {
            for &next in valid_next(status) {
                assert!(
                    Stage::for_status(next).is_some() || handled_by_loop.contains(&next),
                    "{} -> {} has no handler",
                    status,
                    next
                );
            }
        }
    }
}
