//! # Swarm Orchestration
//!
//! Runs many experiments concurrently, each in its own worktree with its own
//! database, and drives each one through the lifecycle:
//!
//! ```text
//! read status → policy picks next → stage executor (or resolve/persist) → repeat
//! ```
//!
//! Stops on a terminal status, the step budget, or a shutdown request.

pub mod events;
pub mod executor;
pub mod instance;
pub mod process_executor;
pub mod resolve;
pub mod runner;

pub use events::{EventSink, SwarmEvent, SwarmEventKind};
pub use executor::{Stage, StageContext, StageExecutor};
pub use instance::{
    run_instance, step_once, InstanceOutcome, ShutdownSignal, StepOutcome, SwarmExperimentResult,
    WorktreeInfo,
};
pub use process_executor::ProcessStageExecutor;
pub use resolve::{resolve_db_only, Resolution};
pub use runner::{
    archive_instance, cleanup_worktrees, provision_worktrees, run_swarm, SwarmSummary,
};
