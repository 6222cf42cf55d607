//! # Regression Gate
//!
//! Compares before/after snapshots and flags regressions per metric
//! direction. A regression on a gate fixture blocks merge; nothing else does.

use serde::Serialize;
use std::collections::BTreeMap;

use super::{MetricDirection, MetricPhase, MetricSnapshot, MetricsConfig, TrackedMetric};

/// Outcome of comparing one (fixture, metric) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricComparison {
    pub fixture: String,
    pub metric: String,
    pub before: f64,
    pub after: f64,
    /// after - before
    pub delta: f64,
    pub regression: bool,
    /// Fixture is a merge gate
    pub gate: bool,
}

/// Compare every tracked (fixture, metric) present in both phases
pub fn compare_metrics(snapshots: &[MetricSnapshot], config: &MetricsConfig) -> Vec<MetricComparison> {
    let mut before: BTreeMap<(&str, &str), f64> = BTreeMap::new();
    let mut after: BTreeMap<(&str, &str), f64> = BTreeMap::new();

    for snapshot in snapshots {
        let key = (snapshot.fixture.as_str(), snapshot.metric.as_str());
        match snapshot.phase {
            MetricPhase::Before => before.insert(key, snapshot.value),
            MetricPhase::After => after.insert(key, snapshot.value),
        };
    }

    before
        .iter()
        .filter_map(|(&(fixture, metric), &before_value)| {
            let tracked = config.tracked.get(metric)?;
            let after_value = *after.get(&(fixture, metric))?;
            Some(MetricComparison {
                fixture: fixture.to_string(),
                metric: metric.to_string(),
                before: before_value,
                after: after_value,
                delta: after_value - before_value,
                regression: is_regression(tracked, before_value, after_value),
                gate: config.fixtures.is_gate(fixture),
            })
        })
        .collect()
}

/// Regressions on gate fixtures; non-empty means merge is blocked
pub fn check_gate_violations(comparisons: &[MetricComparison]) -> Vec<MetricComparison> {
    comparisons
        .iter()
        .filter(|c| c.gate && c.regression)
        .cloned()
        .collect()
}

fn is_regression(tracked: &TrackedMetric, before: f64, after: f64) -> bool {
    match &tracked.direction {
        MetricDirection::LowerIsBetter => after > before,
        MetricDirection::HigherIsBetter => after < before,
        MetricDirection::CloserToGt => match tracked.target {
            Some(target) => (after - target).abs() > (before - target).abs(),
            None => false,
        },
        MetricDirection::Unknown(_) => false,
    }
}
