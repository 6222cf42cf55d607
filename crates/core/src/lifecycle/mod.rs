//! # Experiment Lifecycle
//!
//! Finite state machine over experiment statuses.
//!
//! ```text
//! classified → reframed → gated → building ⟲ → built → doubted ⟷ challenged
//!     → verifying → verified → resolved → compressed → merged
//!                                  ↘ building (weak)  ↘ dead_end (rejected)
//! ```

pub mod policy;
pub mod status;
pub mod transitions;

use thiserror::Error;

pub use policy::determine_next_step;
pub use status::{ExperimentStatus, Grade};
pub use transitions::{admin_transition, is_terminal, transition, valid_next, AdminReason};

/// Errors raised by the state machine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid transition {from} -> {to} (allowed: {})", join(.allowed))]
    InvalidTransition {
        from: ExperimentStatus,
        to: ExperimentStatus,
        allowed: Vec<ExperimentStatus>,
    },

    #[error("invalid admin transition {from} -> {to} for reason '{reason}'")]
    InvalidAdminTransition {
        from: ExperimentStatus,
        to: ExperimentStatus,
        reason: AdminReason,
    },

    #[error("status '{0}' has no successors")]
    NoSuccessors(ExperimentStatus),

    #[error("unknown experiment status '{0}'")]
    UnknownStatus(String),

    #[error("unknown grade '{0}'")]
    UnknownGrade(String),

    #[error("unknown admin reason '{0}'")]
    UnknownAdminReason(String),
}

fn join(statuses: &[ExperimentStatus]) -> String {
    if statuses.is_empty() {
        return "none".to_string();
    }
    statuses
        .iter()
        .map(ExperimentStatus::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
