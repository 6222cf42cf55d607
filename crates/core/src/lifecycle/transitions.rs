//! # Transition Tables
//!
//! The single authority for which status changes are legal, both for the
//! normal lifecycle and for administrative overrides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::status::ExperimentStatus;
use super::LifecycleError;
use ExperimentStatus::*;

/// Legal successors of a status, in declared order.
///
/// The order is significant: the next-step policy falls back to the first
/// entry when no rule prefers another one.
pub fn valid_next(status: ExperimentStatus) -> &'static [ExperimentStatus] {
    match status {
        Classified => &[Reframed, Gated],
        Reframed => &[Gated],
        Gated => &[Building],
        Building => &[Building, Built],
        Built => &[Challenged, Doubted],
        Challenged => &[Doubted, Verifying],
        Doubted => &[Challenged, Scouted, Verifying],
        Scouted => &[Verifying],
        Verifying => &[Verified],
        Verified => &[Resolved],
        Resolved => &[Compressed, Building, DeadEnd],
        Compressed => &[Merged],
        Merged => &[],
        DeadEnd => &[],
    }
}

/// A status with no successors never changes again
pub fn is_terminal(status: ExperimentStatus) -> bool {
    valid_next(status).is_empty()
}

/// Validate a normal lifecycle transition
pub fn transition(
    current: ExperimentStatus,
    target: ExperimentStatus,
) -> Result<ExperimentStatus, LifecycleError> {
    let allowed = valid_next(current);
    if allowed.contains(&target) {
        Ok(target)
    } else {
        Err(LifecycleError::InvalidTransition {
            from: current,
            to: target,
            allowed: allowed.to_vec(),
        })
    }
}

/// Reason code authorizing a transition outside the normal table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminReason {
    /// Operator abandoned the experiment
    Revert,
    /// Too many dead-ends for the sub-type
    CircuitBreaker,
    /// A stage failed and the instance was contained
    ErrorRecovery,
    /// Operator fixed a status recorded in error
    ManualCorrection,
}

impl AdminReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Revert => "revert",
            Self::CircuitBreaker => "circuit_breaker",
            Self::ErrorRecovery => "error_recovery",
            Self::ManualCorrection => "manual_correction",
        }
    }

    /// Predicate over (current, target) for this reason
    fn permits(&self, current: ExperimentStatus, target: ExperimentStatus) -> bool {
        if is_terminal(current) {
            return false;
        }
        match self {
            Self::Revert | Self::CircuitBreaker | Self::ErrorRecovery => target == DeadEnd,
            Self::ManualCorrection => target != current && !is_terminal(target),
        }
    }
}

impl fmt::Display for AdminReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdminReason {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "revert" => Ok(Self::Revert),
            "circuit_breaker" => Ok(Self::CircuitBreaker),
            "error_recovery" => Ok(Self::ErrorRecovery),
            "manual_correction" => Ok(Self::ManualCorrection),
            other => Err(LifecycleError::UnknownAdminReason(other.to_string())),
        }
    }
}

/// Validate an administrative transition
pub fn admin_transition(
    current: ExperimentStatus,
    target: ExperimentStatus,
    reason: AdminReason,
) -> Result<ExperimentStatus, LifecycleError> {
    if reason.permits(current, target) {
        Ok(target)
    } else {
        Err(LifecycleError::InvalidAdminTransition {
            from: current,
            to: target,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_merged_and_dead_end_are_terminal() {
        for status in ExperimentStatus::ALL {
            let expected = matches!(status, Merged | DeadEnd);
            assert_eq!(is_terminal(status), expected, "{}", status);
            assert_eq!(valid_next(status).is_empty(), expected);
        }
    }

    #[test]
    fn test_transition_matches_table_for_every_pair() {
        for from in ExperimentStatus::ALL {
            for to in ExperimentStatus::ALL {
                let legal = valid_next(from).contains(&to);
                assert_eq!(transition(from, to).is_ok(), legal, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_invalid_transition_names_pair_and_allowed_set() {
        let err = transition(Built, Merged).unwrap_err();
        match &err {
            LifecycleError::InvalidTransition { from, to, allowed } => {
                assert_eq!(*from, Built);
                assert_eq!(*to, Merged);
                assert_eq!(allowed, &vec![Challenged, Doubted]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let message = err.to_string();
        assert!(message.contains("built"));
        assert!(message.contains("merged"));
    }

    #[test]
    fn test_admin_revert_only_to_dead_end() {
        assert_eq!(
            admin_transition(Building, DeadEnd, AdminReason::Revert).unwrap(),
            DeadEnd
        );
        assert!(admin_transition(Building, Merged, AdminReason::Revert).is_err());
        assert!(admin_transition(Merged, DeadEnd, AdminReason::ErrorRecovery).is_err());
    }

    #[test]
    fn test_admin_manual_correction_never_leaves_terminal() {
        assert!(admin_transition(Verified, Building, AdminReason::ManualCorrection).is_ok());
        assert!(admin_transition(Verified, Merged, AdminReason::ManualCorrection).is_err());
        assert!(admin_transition(DeadEnd, Building, AdminReason::ManualCorrection).is_err());
        assert!(admin_transition(Built, Built, AdminReason::ManualCorrection).is_err());
    }

    #[test]
    fn test_admin_reason_parse() {
        assert_eq!(
            "circuit_breaker".parse::<AdminReason>().unwrap(),
            AdminReason::CircuitBreaker
        );
        assert!("because".parse::<AdminReason>().is_err());
    }
}
