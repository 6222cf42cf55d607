//! # Next-Step Policy
//!
//! Picks one concrete successor when the transition table offers several.
//! Pure: the same inputs always yield the same status.

use super::status::ExperimentStatus;
use super::LifecycleError;
use crate::state::Experiment;
use ExperimentStatus::*;

/// Resolve which legal successor the experiment moves to next.
///
/// `has_doubts` / `has_challenges` report whether those records already exist
/// for the experiment. Quality gates come first: a classification passes the
/// gate before building, a built artifact is doubted before it is verified.
pub fn determine_next_step(
    experiment: &Experiment,
    valid: &[ExperimentStatus],
    has_doubts: bool,
    has_challenges: bool,
) -> Result<ExperimentStatus, LifecycleError> {
    let status = experiment.status;
    let Some(&first) = valid.first() else {
        return Err(LifecycleError::NoSuccessors(status));
    };
    let legal = |s: ExperimentStatus| valid.contains(&s);

    let preferred = match status {
        Classified | Reframed => Some(if legal(Gated) { Gated } else { first }),
        Gated if legal(Building) => Some(Building),
        Built if !has_doubts && legal(Doubted) => Some(Doubted),
        Doubted if !has_challenges && legal(Challenged) => Some(Challenged),
        Doubted | Challenged if legal(Verifying) => Some(Verifying),
        Building if legal(Building) => Some(Building),
        Scouted if legal(Verifying) => Some(Verifying),
        Verified if legal(Resolved) => Some(Resolved),
        Resolved if legal(Compressed) => Some(Compressed),
        Compressed if legal(Merged) => Some(Merged),
        _ => None,
    };

    Ok(preferred.unwrap_or(first))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::valid_next;

    fn experiment_at(status: ExperimentStatus) -> Experiment {
        Experiment::detached("exp", "hypothesis", status)
    }

    fn next(status: ExperimentStatus, doubts: bool, challenges: bool) -> ExperimentStatus {
        determine_next_step(&experiment_at(status), valid_next(status), doubts, challenges)
            .unwrap()
    }

    #[test]
    fn test_terminal_has_no_next_step() {
        let err = determine_next_step(&experiment_at(Merged), valid_next(Merged), false, false)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NoSuccessors(Merged)));
    }

    #[test]
    fn test_classification_goes_through_gate() {
        assert_eq!(next(Classified, false, false), Gated);
        assert_eq!(next(Reframed, false, false), Gated);
        assert_eq!(next(Gated, false, false), Building);
    }

    #[test]
    fn test_classified_without_gate_takes_first_option() {
        let exp = experiment_at(Classified);
        let step = determine_next_step(&exp, &[Reframed], false, false).unwrap();
        assert_eq!(step, Reframed);
    }

    #[test]
    fn test_built_must_be_doubted_first() {
        assert_eq!(next(Built, false, false), Doubted);
        assert_eq!(next(Built, false, true), Doubted);
        // Doubts already recorded: fall back to declared order
        assert_eq!(next(Built, true, false), Challenged);
    }

    #[test]
    fn test_doubted_requires_challenge_before_verify() {
        assert_eq!(next(Doubted, true, false), Challenged);
        assert_eq!(next(Doubted, true, true), Verifying);
        assert_eq!(next(Challenged, true, true), Verifying);
    }

    #[test]
    fn test_building_self_loops() {
        assert_eq!(next(Building, false, false), Building);
    }

    #[test]
    fn test_tail_of_lifecycle() {
        assert_eq!(next(Scouted, true, true), Verifying);
        assert_eq!(next(Verifying, true, true), Verified);
        assert_eq!(next(Verified, true, true), Resolved);
        assert_eq!(next(Resolved, true, true), Compressed);
        assert_eq!(next(Compressed, true, true), Merged);
    }

    #[test]
    fn test_policy_is_deterministic() {
        for status in ExperimentStatus::ALL {
            if valid_next(status).is_empty() {
                continue;
            }
            for doubts in [false, true] {
                for challenges in [false, true] {
                    let a = next(status, doubts, challenges);
                    let b = next(status, doubts, challenges);
                    assert_eq!(a, b);
                    assert!(valid_next(status).contains(&a));
                }
            }
        }
    }
}
