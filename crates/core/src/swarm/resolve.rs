//! # Resolution
//!
//! Grades a verified experiment from what the verifier recorded and the
//! metrics gate, without touching git. Weak work goes back to building,
//! rejected work is dead-ended, sound or good work stays resolved and
//! heads for compression.

use anyhow::Result;
use serde::Serialize;

use crate::config::CrucibleConfig;
use crate::lifecycle::{self, ExperimentStatus, Grade};
use crate::metrics::{check_gate_violations, compare_metrics, MetricComparison};
use crate::state::{
    CircuitBreakerState, CrucibleDb, DeadEndCategory, DeadEndManager, ExperimentManager,
    FindingManager, MetricManager, NewDeadEnd,
};

/// What resolution decided
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub grade: Grade,
    /// Status after resolution (`resolved`, `building` or `dead_end`)
    pub status: ExperimentStatus,
    pub violations: Vec<MetricComparison>,
    /// Set when a rejection tripped the sub-type's breaker
    pub circuit_breaker: Option<CircuitBreakerState>,
}

/// Resolve experiment `id`, which must be `verified`.
///
/// Only the latest verification round is graded; a round that produced
/// no grades counts as weak.
#[tracing::instrument(skip(db, config))]
pub fn resolve_db_only(db: &CrucibleDb, id: i64, config: &CrucibleConfig) -> Result<Resolution> {
    let experiments = ExperimentManager::new(db);
    let experiment = experiments.get(id)?;
    lifecycle::transition(experiment.status, ExperimentStatus::Resolved)?;

    let recorded = FindingManager::new(db).latest_grades(id)?;
    let mut grade = recorded.iter().map(|g| g.grade).max().unwrap_or(Grade::Weak);

    let snapshots = MetricManager::new(db).for_experiment(id)?;
    let violations = check_gate_violations(&compare_metrics(&snapshots, &config.metrics));
    if !violations.is_empty() && grade < Grade::Weak {
        tracing::warn!(
            violations = violations.len(),
            "Gate fixtures regressed; capping grade at weak"
        );
        grade = Grade::Weak;
    }

    experiments.set_grade(id, grade)?;
    experiments.transition(id, ExperimentStatus::Resolved)?;

    let mut circuit_breaker = None;
    let status = match grade {
        Grade::Sound | Grade::Good => ExperimentStatus::Resolved,
        Grade::Weak => {
            experiments.transition(id, ExperimentStatus::Building)?;
            ExperimentStatus::Building
        }
        Grade::Rejected => {
            let rejected: Vec<String> = recorded
                .iter()
                .filter(|g| g.grade == Grade::Rejected)
                .map(|g| g.component.clone())
                .collect();
            let dead_ends = DeadEndManager::new(db);
            dead_ends.record(&NewDeadEnd {
                experiment_id: Some(id),
                approach: experiment.hypothesis.clone(),
                structural_constraint: format!("Rejected by verification: {}", rejected.join(", ")),
                sub_type: experiment.sub_type.clone(),
                category: DeadEndCategory::Structural,
            })?;
            experiments.transition(id, ExperimentStatus::DeadEnd)?;

            if let Some(sub_type) = &experiment.sub_type {
                let state =
                    dead_ends.circuit_breaker(sub_type, config.cycle.circuit_breaker_threshold)?;
                if state.tripped {
                    tracing::warn!(
                        sub_type = %state.sub_type,
                        count = state.count,
                        threshold = state.threshold,
                        "Circuit breaker tripped"
                    );
                    circuit_breaker = Some(state);
                }
            }
            ExperimentStatus::DeadEnd
        }
    };

    tracing::info!(grade = %grade, status = %status, "Experiment resolved");
    Ok(Resolution {
        grade,
        status,
        violations,
        circuit_breaker,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ComponentGrade, StructuredOutput};
    use crate::metrics::{FixtureConfig, FixtureSet, MetricDirection, MetricPhase, MetricSnapshot, TrackedMetric};
    use crate::state::NewExperiment;
    use std::collections::BTreeMap;

    fn verified_experiment(db: &CrucibleDb, slug: &str, sub_type: Option<&str>) -> i64 {
        let mut new = NewExperiment::new(slug, "hypothesis").starting_at(ExperimentStatus::Verified);
        if let Some(sub_type) = sub_type {
            new = new.with_sub_type(sub_type);
        }
        ExperimentManager::new(db).create(&new).unwrap().id
    }

    fn grade(db: &CrucibleDb, id: i64, grades: &[(&str, Grade)]) {
        let output = StructuredOutput {
            grades: grades
                .iter()
                .map(|(component, grade)| ComponentGrade {
                    component: component.to_string(),
                    grade: *grade,
                })
                .collect(),
            ..Default::default()
        };
        FindingManager::new(db).record_output(id, &output).unwrap();
    }

    fn test_db(dir: &tempfile::TempDir) -> CrucibleDb {
        CrucibleDb::open_at(dir.path().join("resolve.db")).unwrap()
    }

    #[test]
    fn test_sound_grades_stay_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir);
        let id = verified_experiment(&db, "good", None);
        grade(&db, id, &[("parser", Grade::Sound), ("cache", Grade::Good)]);

        let resolution = resolve_db_only(&db, id, &CrucibleConfig::default()).unwrap();
        assert_eq!(resolution.grade, Grade::Good);
        assert_eq!(resolution.status, ExperimentStatus::Resolved);

        let exp = ExperimentManager::new(&db).get(id).unwrap();
        assert_eq!(exp.status, ExperimentStatus::Resolved);
        assert_eq!(exp.grade, Some(Grade::Good));
    }

    #[test]
    fn test_no_grades_means_weak_and_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir);
        let id = verified_experiment(&db, "ungraded", None);

        let resolution = resolve_db_only(&db, id, &CrucibleConfig::default()).unwrap();
        assert_eq!(resolution.grade, Grade::Weak);
        assert_eq!(resolution.status, ExperimentStatus::Building);
    }

    #[test]
    fn test_rejected_records_structural_dead_end() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir);
        let mut config = CrucibleConfig::default();
        config.cycle.circuit_breaker_threshold = 1;

        let id = verified_experiment(&db, "bad", Some("perf"));
        grade(&db, id, &[("parser", Grade::Sound), ("cache", Grade::Rejected)]);

        let resolution = resolve_db_only(&db, id, &config).unwrap();
        assert_eq!(resolution.status, ExperimentStatus::DeadEnd);
        assert!(resolution.circuit_breaker.unwrap().tripped);

        let dead_ends = DeadEndManager::new(&db).for_experiment(id).unwrap();
        assert_eq!(dead_ends.len(), 1);
        assert_eq!(dead_ends[0].category, DeadEndCategory::Structural);
        assert!(dead_ends[0].structural_constraint.contains("cache"));
    }

    #[test]
    fn test_gate_violation_caps_grade() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir);
        let id = verified_experiment(&db, "regressed", None);
        grade(&db, id, &[("parser", Grade::Sound)]);

        let mut fixtures = BTreeMap::new();
        fixtures.insert("hot".to_string(), FixtureConfig { gate: true });
        let mut config = CrucibleConfig::default();
        config.metrics.fixtures = FixtureSet::Flagged(fixtures);
        config.metrics.tracked.insert(
            "latency".to_string(),
            TrackedMetric {
                direction: MetricDirection::LowerIsBetter,
                target: None,
            },
        );

        let snapshot = |phase, value| MetricSnapshot {
            experiment_id: id,
            phase,
            fixture: "hot".to_string(),
            metric: "latency".to_string(),
            value,
        };
        MetricManager::new(&db)
            .record(&[snapshot(MetricPhase::Before, 10.0), snapshot(MetricPhase::After, 12.0)])
            .unwrap();

        let resolution = resolve_db_only(&db, id, &config).unwrap();
        assert_eq!(resolution.violations.len(), 1);
        assert_eq!(resolution.grade, Grade::Weak);
        assert_eq!(resolution.status, ExperimentStatus::Building);
    }

    #[test]
    fn test_empty_round_does_not_reuse_earlier_grades() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir);
        let id = verified_experiment(&db, "reverified", None);
        grade(&db, id, &[("parser", Grade::Sound)]);

        // The re-verification extracted no grades
        FindingManager::new(&db).begin_verification(id).unwrap();

        let resolution = resolve_db_only(&db, id, &CrucibleConfig::default()).unwrap();
        assert_eq!(resolution.grade, Grade::Weak);
        assert_eq!(resolution.status, ExperimentStatus::Building);
    }

    #[test]
    fn test_requires_verified_status() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir);
        let id = ExperimentManager::new(&db)
            .create(&NewExperiment::new("early", "h"))
            .unwrap()
            .id;
        assert!(resolve_db_only(&db, id, &CrucibleConfig::default()).is_err());
    }
}
