//! # Metrics
//!
//! Before/after measurements of an experiment and the regression gate that
//! decides whether it may merge.
//!
//! The metrics command prints `{"fixtures": {name: {metric: number}}}`; each
//! number becomes a [`MetricSnapshot`] for the phase being captured.

pub mod capture;
pub mod gate;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use capture::{capture_metrics, parse_metrics_output, MetricReading};
pub use gate::{check_gate_violations, compare_metrics, MetricComparison};

/// When a snapshot was taken relative to the change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricPhase {
    Before,
    After,
}

impl MetricPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }
}

impl fmt::Display for MetricPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            other => anyhow::bail!("unknown metric phase '{}'", other),
        }
    }
}

/// One stored measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub experiment_id: i64,
    pub phase: MetricPhase,
    pub fixture: String,
    pub metric: String,
    pub value: f64,
}

/// Which way a metric should move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MetricDirection {
    LowerIsBetter,
    HigherIsBetter,
    /// Should approach the configured ground-truth target
    CloserToGt,
    /// Unrecognized direction; never flags a regression
    Unknown(String),
}

impl From<String> for MetricDirection {
    fn from(value: String) -> Self {
        match value.as_str() {
            "lower_is_better" => Self::LowerIsBetter,
            "higher_is_better" => Self::HigherIsBetter,
            "closer_to_gt" => Self::CloserToGt,
            _ => Self::Unknown(value),
        }
    }
}

impl From<MetricDirection> for String {
    fn from(value: MetricDirection) -> Self {
        match value {
            MetricDirection::LowerIsBetter => "lower_is_better".to_string(),
            MetricDirection::HigherIsBetter => "higher_is_better".to_string(),
            MetricDirection::CloserToGt => "closer_to_gt".to_string(),
            MetricDirection::Unknown(raw) => raw,
        }
    }
}

/// A tracked metric and how to judge it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedMetric {
    pub direction: MetricDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
}

/// Per-fixture settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureConfig {
    /// Regressions on this fixture block merge
    #[serde(default)]
    pub gate: bool,
}

/// Fixture declarations: either a legacy list of names or a map with flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FixtureSet {
    /// Legacy form; no fixture gates
    Names(Vec<String>),
    Flagged(BTreeMap<String, FixtureConfig>),
}

impl Default for FixtureSet {
    fn default() -> Self {
        Self::Flagged(BTreeMap::new())
    }
}

impl FixtureSet {
    pub fn is_gate(&self, fixture: &str) -> bool {
        match self {
            Self::Names(_) => false,
            Self::Flagged(map) => map.get(fixture).map(|f| f.gate).unwrap_or(false),
        }
    }
}

/// Metrics section of the project configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Shell command that prints the fixtures JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub fixtures: FixtureSet,
    /// Metric name -> direction/target
    #[serde(default)]
    pub tracked: BTreeMap<String, TrackedMetric>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_direction_deserializes() {
        let metric: TrackedMetric =
            serde_json::from_str(r#"{"direction": "sideways"}"#).unwrap();
        assert_eq!(metric.direction, MetricDirection::Unknown("sideways".to_string()));

        let metric: TrackedMetric =
            serde_json::from_str(r#"{"direction": "closer_to_gt", "target": 1.0}"#).unwrap();
        assert_eq!(metric.direction, MetricDirection::CloserToGt);
        assert_eq!(metric.target, Some(1.0));
    }

    #[test]
    fn test_legacy_fixture_list_has_no_gates() {
        let config: MetricsConfig =
            serde_json::from_str(r#"{"fixtures": ["small", "large"]}"#).unwrap();
        assert!(matches!(config.fixtures, FixtureSet::Names(_)));
        assert!(!config.fixtures.is_gate("small"));
    }

    #[test]
    fn test_flagged_fixtures() {
        let config: MetricsConfig = serde_json::from_str(
            r#"{"fixtures": {"small": {"gate": true}, "large": {}}}"#,
        )
        .unwrap();
        assert!(config.fixtures.is_gate("small"));
        assert!(!config.fixtures.is_gate("large"));
        assert!(!config.fixtures.is_gate("missing"));
    }
}
