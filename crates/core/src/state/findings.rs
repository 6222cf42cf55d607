//! # Finding Storage
//!
//! Decisions, doubts, challenges and verification grades extracted from
//! worker output. Insert-only.

use super::db::{lock, CrucibleDb};
use crate::extraction::{ComponentGrade, Decision, Doubt, StructuredOutput};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

/// Manager for per-experiment findings
pub struct FindingManager {
    conn: Arc<Mutex<Connection>>,
}

impl FindingManager {
    pub fn new(db: &CrucibleDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Persist everything an extraction produced, in one transaction
    pub fn record_output(&self, experiment_id: i64, output: &StructuredOutput) -> Result<()> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        for decision in &output.decisions {
            tx.execute(
                "INSERT INTO decisions (experiment_id, evidence_level, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![experiment_id, decision.evidence.as_str(), decision.description, now],
            )?;
        }
        for doubt in &output.doubts {
            tx.execute(
                "INSERT INTO doubts (experiment_id, description, severity, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![experiment_id, doubt.description, doubt.severity.as_str(), now],
            )?;
        }
        if !output.grades.is_empty() {
            let round_id = match current_round(&tx, experiment_id)? {
                Some(id) => id,
                None => insert_round(&tx, experiment_id, &now)?,
            };
            for grade in &output.grades {
                tx.execute(
                    "INSERT INTO verifications (experiment_id, round_id, component, grade, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![experiment_id, round_id, grade.component, grade.grade.as_str(), now],
                )?;
            }
        }

        tx.commit().context("Failed to record findings")?;
        tracing::debug!(
            experiment_id,
            decisions = output.decisions.len(),
            doubts = output.doubts.len(),
            grades = output.grades.len(),
            "Findings recorded"
        );
        Ok(())
    }

    /// Record an adversarial challenge
    pub fn add_challenge(&self, experiment_id: i64, description: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO challenges (experiment_id, description, created_at) VALUES (?1, ?2, ?3)",
            params![experiment_id, description, Utc::now().to_rfc3339()],
        )
        .context("Failed to record challenge")?;
        Ok(())
    }

    pub fn has_doubts(&self, experiment_id: i64) -> Result<bool> {
        self.exists("doubts", experiment_id)
    }

    pub fn has_challenges(&self, experiment_id: i64) -> Result<bool> {
        self.exists("challenges", experiment_id)
    }

    pub fn decisions(&self, experiment_id: i64) -> Result<Vec<Decision>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT evidence_level, description FROM decisions WHERE experiment_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![experiment_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut decisions = Vec::new();
        for row in rows {
            let (evidence, description) = row?;
            decisions.push(Decision {
                evidence: evidence.parse()?,
                description,
            });
        }
        Ok(decisions)
    }

    pub fn doubts(&self, experiment_id: i64) -> Result<Vec<Doubt>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT description, severity FROM doubts WHERE experiment_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![experiment_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut doubts = Vec::new();
        for row in rows {
            let (description, severity) = row?;
            doubts.push(Doubt {
                description,
                severity: severity.parse()?,
            });
        }
        Ok(doubts)
    }

    pub fn challenges(&self, experiment_id: i64) -> Result<Vec<String>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare("SELECT description FROM challenges WHERE experiment_id = ?1 ORDER BY id")?;
        let challenges = stmt
            .query_map(params![experiment_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(challenges)
    }

    /// Verification grades, oldest first
    pub fn grades(&self, experiment_id: i64) -> Result<Vec<ComponentGrade>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT component, grade FROM verifications WHERE experiment_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![experiment_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut grades = Vec::new();
        for row in rows {
            let (component, grade) = row?;
            grades.push(ComponentGrade {
                component,
                grade: grade.parse()?,
            });
        }
        Ok(grades)
    }

    /// Open a new verification round. Grades recorded afterwards belong to
    /// it until the next round starts.
    pub fn begin_verification(&self, experiment_id: i64) -> Result<i64> {
        let conn = lock(&self.conn)?;
        let round_id = insert_round(&conn, experiment_id, &Utc::now().to_rfc3339())
            .context("Failed to start verification round")?;
        tracing::debug!(experiment_id, round_id, "Verification round started");
        Ok(round_id)
    }

    /// Grades from the most recent verification round only.
    ///
    /// Empty when no round exists or the latest round produced no grades.
    pub fn latest_grades(&self, experiment_id: i64) -> Result<Vec<ComponentGrade>> {
        let conn = lock(&self.conn)?;
        match current_round(&conn, experiment_id)? {
            Some(round_id) => round_grades(&conn, round_id),
            None => Ok(Vec::new()),
        }
    }

    /// Every verification round with its grades, oldest first
    pub fn grades_by_round(&self, experiment_id: i64) -> Result<Vec<Vec<ComponentGrade>>> {
        let conn = lock(&self.conn)?;
        let round_ids = conn
            .prepare("SELECT id FROM verification_rounds WHERE experiment_id = ?1 ORDER BY id")?
            .query_map(params![experiment_id], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;

        round_ids
            .into_iter()
            .map(|round_id| round_grades(&conn, round_id))
            .collect()
    }

    fn exists(&self, table: &'static str, experiment_id: i64) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let found: bool = conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE experiment_id = ?1)",
                table
            ),
            params![experiment_id],
            |row| row.get(0),
        )?;
        Ok(found)
    }
}

fn insert_round(conn: &Connection, experiment_id: i64, now: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO verification_rounds (experiment_id, started_at) VALUES (?1, ?2)",
        params![experiment_id, now],
    )?;
    Ok(conn.last_insert_rowid())
}

fn current_round(conn: &Connection, experiment_id: i64) -> Result<Option<i64>> {
    let round_id = conn
        .query_row(
            "SELECT MAX(id) FROM verification_rounds WHERE experiment_id = ?1",
            params![experiment_id],
            |row| row.get(0),
        )
        .context("Failed to read verification round")?;
    Ok(round_id)
}

fn round_grades(conn: &Connection, round_id: i64) -> Result<Vec<ComponentGrade>> {
    let mut stmt =
        conn.prepare("SELECT component, grade FROM verifications WHERE round_id = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![round_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut grades = Vec::new();
    for row in rows {
        let (component, grade) = row?;
        grades.push(ComponentGrade {
            component,
            grade: grade.parse()?,
        });
    }
    Ok(grades)
}
