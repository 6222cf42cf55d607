//! # Experiment Storage
//!
//! Experiments are rows in the `experiments` table. Status changes go through
//! the lifecycle tables and are written as a compare-and-set on the current
//! status, so a stale caller can never overwrite a newer status.

use super::db::{lock, CrucibleDb};
use crate::lifecycle::{self, AdminReason, ExperimentStatus, Grade};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// A unit of hypothesis-driven work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    /// Stable human-readable key
    pub slug: String,
    pub branch: String,
    pub hypothesis: String,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub sub_type: Option<String>,
    #[serde(default)]
    pub grade: Option<Grade>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    /// An unsaved experiment, for exercising pure logic
    #[cfg(test)]
    pub(crate) fn detached(slug: &str, hypothesis: &str, status: ExperimentStatus) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            slug: slug.to_string(),
            branch: format!("exp/{}", slug),
            hypothesis: hypothesis.to_string(),
            status,
            sub_type: None,
            grade: None,
            parent_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields needed to create an experiment
#[derive(Debug, Clone)]
pub struct NewExperiment {
    pub slug: String,
    pub branch: String,
    pub hypothesis: String,
    pub sub_type: Option<String>,
    pub parent_id: Option<i64>,
    pub status: ExperimentStatus,
}

impl NewExperiment {
    pub fn new(slug: impl Into<String>, hypothesis: impl Into<String>) -> Self {
        let slug = slug.into();
        Self {
            branch: format!("exp/{}", slug),
            slug,
            hypothesis: hypothesis.into(),
            sub_type: None,
            parent_id: None,
            status: ExperimentStatus::Classified,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_sub_type(mut self, sub_type: impl Into<String>) -> Self {
        self.sub_type = Some(sub_type.into());
        self
    }

    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Start somewhere other than `classified` (the swarm starts at `reframed`)
    pub fn starting_at(mut self, status: ExperimentStatus) -> Self {
        self.status = status;
        self
    }
}

const SELECT_COLUMNS: &str = "SELECT id, slug, branch, hypothesis, status, sub_type, grade, \
     parent_id, created_at, updated_at FROM experiments";

/// Manager for experiment rows
pub struct ExperimentManager {
    conn: Arc<Mutex<Connection>>,
}

impl ExperimentManager {
    pub fn new(db: &CrucibleDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Create an experiment
    pub fn create(&self, new: &NewExperiment) -> Result<Experiment> {
        let conn = lock(&self.conn)?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            r#"
            INSERT INTO experiments (slug, branch, hypothesis, status, sub_type, parent_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            "#,
            params![
                new.slug,
                new.branch,
                new.hypothesis,
                new.status.as_str(),
                new.sub_type,
                new.parent_id,
                now,
            ],
        )
        .with_context(|| format!("Failed to create experiment '{}'", new.slug))?;

        let id = conn.last_insert_rowid();
        tracing::debug!(id, slug = %new.slug, status = %new.status, "Experiment created");
        query_one(&conn, "WHERE id = ?1", params![id])?
            .ok_or_else(|| anyhow::anyhow!("Experiment {} vanished after insert", id))
    }

    /// Load an experiment by id
    pub fn get(&self, id: i64) -> Result<Experiment> {
        let conn = lock(&self.conn)?;
        query_one(&conn, "WHERE id = ?1", params![id])?
            .ok_or_else(|| anyhow::anyhow!("Experiment not found: {}", id))
    }

    /// Load an experiment by slug
    pub fn get_by_slug(&self, slug: &str) -> Result<Experiment> {
        let conn = lock(&self.conn)?;
        query_one(&conn, "WHERE slug = ?1", params![slug])?
            .ok_or_else(|| anyhow::anyhow!("Experiment not found: {}", slug))
    }

    /// Most recently created experiment, if any
    pub fn latest(&self) -> Result<Option<Experiment>> {
        let conn = lock(&self.conn)?;
        query_one(&conn, "ORDER BY id DESC LIMIT 1", [])
    }

    /// All experiments, newest first
    pub fn list_all(&self) -> Result<Vec<Experiment>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY id DESC", SELECT_COLUMNS))?;
        let experiments = stmt
            .query_map([], row_to_experiment)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list experiments")?;
        Ok(experiments)
    }

    /// Move an experiment along the normal transition table
    pub fn transition(&self, id: i64, target: ExperimentStatus) -> Result<Experiment> {
        let current = self.get(id)?;
        lifecycle::transition(current.status, target)?;
        self.compare_and_set(id, current.status, target)
    }

    /// Move an experiment outside the normal table for an administrative reason
    pub fn admin_transition(
        &self,
        id: i64,
        target: ExperimentStatus,
        reason: AdminReason,
    ) -> Result<Experiment> {
        let current = self.get(id)?;
        lifecycle::admin_transition(current.status, target, reason)?;
        tracing::info!(
            id,
            from = %current.status,
            to = %target,
            reason = %reason,
            "Admin transition"
        );
        self.compare_and_set(id, current.status, target)
    }

    /// Record the experiment's overall grade
    pub fn set_grade(&self, id: i64, grade: Grade) -> Result<()> {
        let conn = lock(&self.conn)?;
        let affected = conn.execute(
            "UPDATE experiments SET grade = ?1, updated_at = ?2 WHERE id = ?3",
            params![grade.as_str(), Utc::now().to_rfc3339(), id],
        )?;

        if affected == 0 {
            anyhow::bail!("Experiment not found: {}", id);
        }
        Ok(())
    }

    /// Single-row status write guarded by the expected current status
    fn compare_and_set(
        &self,
        id: i64,
        expected: ExperimentStatus,
        target: ExperimentStatus,
    ) -> Result<Experiment> {
        let conn = lock(&self.conn)?;
        let affected = conn.execute(
            "UPDATE experiments SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                target.as_str(),
                Utc::now().to_rfc3339(),
                id,
                expected.as_str()
            ],
        )?;

        if affected == 0 {
            anyhow::bail!(
                "Experiment {} is no longer '{}'; refusing to move it to '{}'",
                id,
                expected,
                target
            );
        }

        query_one(&conn, "WHERE id = ?1", params![id])?
            .ok_or_else(|| anyhow::anyhow!("Experiment not found: {}", id))
    }
}

fn query_one<P: rusqlite::Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> Result<Option<Experiment>> {
    conn.query_row(
        &format!("{} {}", SELECT_COLUMNS, clause),
        params,
        row_to_experiment,
    )
    .optional()
    .context("Failed to read experiment")
}

fn row_to_experiment(row: &rusqlite::Row) -> rusqlite::Result<Experiment> {
    let status: String = row.get(4)?;
    let grade: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    let status = status
        .parse::<ExperimentStatus>()
        .map_err(|e| conversion_error(4, e))?;
    let grade = grade
        .map(|g| g.parse::<Grade>())
        .transpose()
        .map_err(|e| conversion_error(6, e))?;

    Ok(Experiment {
        id: row.get(0)?,
        slug: row.get(1)?,
        branch: row.get(2)?,
        hypothesis: row.get(3)?,
        status,
        sub_type: row.get(5)?,
        grade,
        parent_id: row.get(7)?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleError;

    fn manager() -> (tempfile::TempDir, ExperimentManager) {
        let dir = tempfile::tempdir().unwrap();
        let db = CrucibleDb::open_at(dir.path().join("exp.db")).unwrap();
        let mgr = ExperimentManager::new(&db);
        (dir, mgr)
    }

    #[test]
    fn test_create_and_load() {
        let (_dir, mgr) = manager();
        let exp = mgr
            .create(&NewExperiment::new("faster-io", "Batching writes halves latency").with_sub_type("io"))
            .unwrap();

        assert!(exp.id > 0);
        assert_eq!(exp.status, ExperimentStatus::Classified);
        assert_eq!(exp.branch, "exp/faster-io");

        let by_slug = mgr.get_by_slug("faster-io").unwrap();
        assert_eq!(by_slug.id, exp.id);
        assert_eq!(by_slug.sub_type.as_deref(), Some("io"));
        assert_eq!(mgr.latest().unwrap().unwrap().slug, "faster-io");
    }

    #[test]
    fn test_duplicate_slug_fails() {
        let (_dir, mgr) = manager();
        mgr.create(&NewExperiment::new("dup", "a")).unwrap();
        assert!(mgr.create(&NewExperiment::new("dup", "b")).is_err());
    }

    #[test]
    fn test_transition_validates_against_table() {
        let (_dir, mgr) = manager();
        let exp = mgr
            .create(&NewExperiment::new("t", "h").starting_at(ExperimentStatus::Reframed))
            .unwrap();

        let exp = mgr.transition(exp.id, ExperimentStatus::Gated).unwrap();
        assert_eq!(exp.status, ExperimentStatus::Gated);

        let err = mgr.transition(exp.id, ExperimentStatus::Merged).unwrap_err();
        let lifecycle_err = err.downcast_ref::<LifecycleError>().unwrap();
        assert!(matches!(
            lifecycle_err,
            LifecycleError::InvalidTransition { .. }
        ));
        assert_eq!(mgr.get(exp.id).unwrap().status, ExperimentStatus::Gated);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let (_dir, mgr) = manager();
        let exp = mgr.create(&NewExperiment::new("t", "h")).unwrap();
        mgr.admin_transition(exp.id, ExperimentStatus::DeadEnd, AdminReason::Revert)
            .unwrap();

        assert!(mgr.transition(exp.id, ExperimentStatus::Reframed).is_err());
        assert!(mgr
            .admin_transition(exp.id, ExperimentStatus::Building, AdminReason::ManualCorrection)
            .is_err());
        assert_eq!(mgr.get(exp.id).unwrap().status, ExperimentStatus::DeadEnd);
    }

    #[test]
    fn test_compare_and_set_rejects_stale_status() {
        let (_dir, mgr) = manager();
        let exp = mgr.create(&NewExperiment::new("t", "h")).unwrap();
        mgr.transition(exp.id, ExperimentStatus::Gated).unwrap();

        let stale = mgr.compare_and_set(exp.id, ExperimentStatus::Classified, ExperimentStatus::Reframed);
        assert!(stale.is_err());
    }

    #[test]
    fn test_set_grade() {
        let (_dir, mgr) = manager();
        let exp = mgr.create(&NewExperiment::new("t", "h")).unwrap();
        mgr.set_grade(exp.id, Grade::Good).unwrap();
        assert_eq!(mgr.get(exp.id).unwrap().grade, Some(Grade::Good));
        assert!(mgr.set_grade(9999, Grade::Good).is_err());
    }
}
