//! # Experiment Status
//!
//! The fixed set of lifecycle statuses and the ordered quality scale
//! used to grade experiments.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::LifecycleError;

/// Lifecycle status of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Sub-type assigned, awaiting reframing or the gate
    Classified,
    /// Hypothesis restated against the current understanding
    Reframed,
    /// Passed the gatekeeper, cleared to build
    Gated,
    /// Builder is implementing (re-entrant)
    Building,
    /// Builder produced an artifact
    Built,
    /// Adversarial challenges recorded
    Challenged,
    /// Doubts recorded
    Doubted,
    /// Scout looked for prior art / alternatives
    Scouted,
    /// Verifier is grading
    Verifying,
    /// Verification grades recorded
    Verified,
    /// Grade decided
    Resolved,
    /// Knowledge compressed into the project record
    Compressed,
    /// Merged (terminal)
    Merged,
    /// Abandoned (terminal)
    DeadEnd,
}

impl ExperimentStatus {
    /// Every status, in lifecycle order
    pub const ALL: [ExperimentStatus; 14] = [
        Self::Classified,
        Self::Reframed,
        Self::Gated,
        Self::Building,
        Self::Built,
        Self::Challenged,
        Self::Doubted,
        Self::Scouted,
        Self::Verifying,
        Self::Verified,
        Self::Resolved,
        Self::Compressed,
        Self::Merged,
        Self::DeadEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classified => "classified",
            Self::Reframed => "reframed",
            Self::Gated => "gated",
            Self::Building => "building",
            Self::Built => "built",
            Self::Challenged => "challenged",
            Self::Doubted => "doubted",
            Self::Scouted => "scouted",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::Resolved => "resolved",
            Self::Compressed => "compressed",
            Self::Merged => "merged",
            Self::DeadEnd => "dead_end",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| LifecycleError::UnknownStatus(s.to_string()))
    }
}

/// Quality grade, ordered best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Sound,
    Good,
    Weak,
    Rejected,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sound => "sound",
            Self::Good => "good",
            Self::Weak => "weak",
            Self::Rejected => "rejected",
        }
    }

    /// Whether an experiment with this grade may proceed towards merge
    pub fn is_mergeable(&self) -> bool {
        matches!(self, Self::Sound | Self::Good)
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grade {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sound" => Ok(Self::Sound),
            "good" => Ok(Self::Good),
            "weak" => Ok(Self::Weak),
            "rejected" => Ok(Self::Rejected),
            other => Err(LifecycleError::UnknownGrade(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in ExperimentStatus::ALL {
            let parsed: ExperimentStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_status_serialization_matches_as_str() {
        let json = serde_json::to_string(&ExperimentStatus::DeadEnd).unwrap();
        assert_eq!(json, "\"dead_end\"");
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let err = "finished".parse::<ExperimentStatus>().unwrap_err();
        assert!(matches!(err, LifecycleError::UnknownStatus(s) if s == "finished"));
    }

    #[test]
    fn test_grade_ordering_worst_is_max() {
        let grades = [Grade::Good, Grade::Rejected, Grade::Sound, Grade::Weak];
        assert_eq!(grades.iter().max(), Some(&Grade::Rejected));
        assert_eq!(grades.iter().min(), Some(&Grade::Sound));
        assert_eq!(" Weak ".parse::<Grade>().unwrap(), Grade::Weak);
    }
}
