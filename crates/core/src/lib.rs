//! # Crucible Core
//!
//! Orchestration engine for hypothesis-driven experiments: the lifecycle
//! state machine, the swarm runner, the metrics regression gate, and the
//! extraction pipeline that turns worker output into records.
//!
//! ## Architecture
//!
//! - `lifecycle/` - Statuses, transition tables and the next-step policy
//! - `state/` - SQLite storage (experiments, sessions, dead-ends, findings, metrics)
//!   and the archive that folds instance databases into the project one
//! - `metrics/` - Metric capture and the before/after gate
//! - `extraction/` - Tiered parsing of worker output
//! - `swarm/` - Concurrent instance runner and stage executors
//! - `tools/` - Git worktree provisioning
//! - `config` / `models` - Project configuration and interpreter model selection
//!
//! ## Usage
//!
//! ```rust,ignore
//! use crucible_core::swarm::{run_swarm, EventSink, ProcessStageExecutor, ShutdownSignal};
//!
//! let executor = Arc::new(ProcessStageExecutor::from_config(&config)?);
//! let summary = run_swarm(worktrees, executor, Arc::new(config), ShutdownSignal::new(), EventSink::silent()).await?;
//! println!("{} merged", summary.merged());
//! ```

pub mod config;
pub mod extraction;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod state;
pub mod swarm;
pub mod tools;
