//! # Metric Snapshot Storage
//!
//! One row per (experiment, phase, fixture, metric). Re-capturing a phase
//! replaces the previous value for the same key.

use super::db::{lock, CrucibleDb};
use crate::metrics::{MetricPhase, MetricSnapshot};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

/// Manager for metric snapshots
pub struct MetricManager {
    conn: Arc<Mutex<Connection>>,
}

impl MetricManager {
    pub fn new(db: &CrucibleDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Insert or replace a batch of snapshots atomically
    pub fn record(&self, snapshots: &[MetricSnapshot]) -> Result<usize> {
        if let Some(bad) = snapshots.iter().find(|s| !s.value.is_finite()) {
            anyhow::bail!(
                "Refusing non-finite value for {}/{}: {}",
                bad.fixture,
                bad.metric,
                bad.value
            );
        }

        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        for snapshot in snapshots {
            tx.execute(
                r#"
                INSERT INTO metrics (experiment_id, phase, fixture, metric_name, value, captured_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(experiment_id, phase, fixture, metric_name) DO UPDATE SET
                    value = ?5,
                    captured_at = ?6
                "#,
                params![
                    snapshot.experiment_id,
                    snapshot.phase.as_str(),
                    snapshot.fixture,
                    snapshot.metric,
                    snapshot.value,
                    now,
                ],
            )?;
        }

        tx.commit().context("Failed to record metric snapshots")?;
        Ok(snapshots.len())
    }

    /// All snapshots of an experiment, both phases
    pub fn for_experiment(&self, experiment_id: i64) -> Result<Vec<MetricSnapshot>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT experiment_id, phase, fixture, metric_name, value
            FROM metrics
            WHERE experiment_id = ?1
            ORDER BY fixture, metric_name, phase
            "#,
        )?;

        let rows = stmt.query_map(params![experiment_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (experiment_id, phase, fixture, metric, value) = row?;
            snapshots.push(MetricSnapshot {
                experiment_id,
                phase: phase.parse::<MetricPhase>()?,
                fixture,
                metric,
                value,
            });
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExperimentManager, NewExperiment};

    #[test]
    fn test_record_upserts_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let db = CrucibleDb::open_at(dir.path().join("metrics.db")).unwrap();
        let exp = ExperimentManager::new(&db)
            .create(&NewExperiment::new("m", "h"))
            .unwrap();
        let mgr = MetricManager::new(&db);

        let snap = |value: f64| MetricSnapshot {
            experiment_id: exp.id,
            phase: MetricPhase::Before,
            fixture: "small".to_string(),
            metric: "latency_ms".to_string(),
            value,
        };

        mgr.record(&[snap(10.0)]).unwrap();
        mgr.record(&[snap(12.0)]).unwrap();

        let stored = mgr.for_experiment(exp.id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value, 12.0);
    }

    #[test]
    fn test_non_finite_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = CrucibleDb::open_at(dir.path().join("metrics-nan.db")).unwrap();
        let exp = ExperimentManager::new(&db)
            .create(&NewExperiment::new("m", "h"))
            .unwrap();
        let mgr = MetricManager::new(&db);

        let result = mgr.record(&[MetricSnapshot {
            experiment_id: exp.id,
            phase: MetricPhase::After,
            fixture: "small".to_string(),
            metric: "latency_ms".to_string(),
            value: f64::NAN,
        }]);
        assert!(result.is_err());
        assert!(mgr.for_experiment(exp.id).unwrap().is_empty());
    }
}
