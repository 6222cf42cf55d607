//! # Dead-End Storage
//!
//! Terminal failure records and the circuit breaker derived from them.

use super::db::{lock, CrucibleDb};
use super::experiments::parse_timestamp;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Why an approach failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeadEndCategory {
    /// The approach cannot work given a structural constraint
    Structural,
    /// The attempt failed mechanically (tooling, crash, bad output)
    Procedural,
}

impl DeadEndCategory {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::Procedural => "procedural",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "procedural" => Self::Procedural,
            _ => Self::Structural,
        }
    }
}

/// A recorded terminal failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadEnd {
    pub id: i64,
    #[serde(default)]
    pub experiment_id: Option<i64>,
    pub approach: String,
    pub structural_constraint: String,
    #[serde(default)]
    pub sub_type: Option<String>,
    pub category: DeadEndCategory,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to record a dead-end
#[derive(Debug, Clone)]
pub struct NewDeadEnd {
    pub experiment_id: Option<i64>,
    pub approach: String,
    pub structural_constraint: String,
    pub sub_type: Option<String>,
    pub category: DeadEndCategory,
}

/// Circuit breaker for one sub-type, derived from dead-end history
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub sub_type: String,
    /// Dead-ends since the sub-type last merged
    pub count: usize,
    pub threshold: usize,
    pub tripped: bool,
}

/// Manager for dead-end rows
pub struct DeadEndManager {
    conn: Arc<Mutex<Connection>>,
}

impl DeadEndManager {
    pub fn new(db: &CrucibleDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Record a dead-end
    pub fn record(&self, new: &NewDeadEnd) -> Result<DeadEnd> {
        let conn = lock(&self.conn)?;
        let now = Utc::now();

        conn.execute(
            r#"
            INSERT INTO dead_ends (experiment_id, approach, structural_constraint, sub_type, category, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                new.experiment_id,
                new.approach,
                new.structural_constraint,
                new.sub_type,
                new.category.as_str(),
                now.to_rfc3339(),
            ],
        )
        .context("Failed to record dead-end")?;

        tracing::warn!(
            experiment_id = ?new.experiment_id,
            category = new.category.as_str(),
            "Dead-end recorded: {}",
            new.structural_constraint
        );

        Ok(DeadEnd {
            id: conn.last_insert_rowid(),
            experiment_id: new.experiment_id,
            approach: new.approach.clone(),
            structural_constraint: new.structural_constraint.clone(),
            sub_type: new.sub_type.clone(),
            category: new.category,
            created_at: now,
        })
    }

    /// Dead-ends, newest first, optionally for one sub-type
    pub fn list(&self, sub_type: Option<&str>) -> Result<Vec<DeadEnd>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, experiment_id, approach, structural_constraint, sub_type, category, created_at
            FROM dead_ends
            WHERE ?1 IS NULL OR sub_type = ?1
            ORDER BY id DESC
            "#,
        )?;

        let dead_ends = stmt
            .query_map(params![sub_type], row_to_dead_end)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list dead-ends")?;
        Ok(dead_ends)
    }

    /// Dead-ends recorded against one experiment
    pub fn for_experiment(&self, experiment_id: i64) -> Result<Vec<DeadEnd>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, experiment_id, approach, structural_constraint, sub_type, category, created_at
            FROM dead_ends
            WHERE experiment_id = ?1
            ORDER BY id
            "#,
        )?;

        let dead_ends = stmt
            .query_map(params![experiment_id], row_to_dead_end)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list dead-ends")?;
        Ok(dead_ends)
    }

    /// Compute the circuit breaker for a sub-type.
    ///
    /// Counts dead-ends recorded since the most recent merge of that sub-type.
    pub fn circuit_breaker(&self, sub_type: &str, threshold: usize) -> Result<CircuitBreakerState> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM dead_ends
            WHERE sub_type = ?1
              AND id > COALESCE((
                  SELECT MAX(d.id) FROM dead_ends d
                  WHERE d.sub_type = ?1
                    AND d.created_at <= (
                        SELECT MAX(e.updated_at) FROM experiments e
                        WHERE e.sub_type = ?1 AND e.status = 'merged'
                    )
              ), 0)
            "#,
            params![sub_type],
            |row| row.get(0),
        )?;

        let count = count as usize;
        Ok(CircuitBreakerState {
            sub_type: sub_type.to_string(),
            count,
            threshold,
            tripped: threshold > 0 && count >= threshold,
        })
    }
}

fn row_to_dead_end(row: &rusqlite::Row) -> rusqlite::Result<DeadEnd> {
    let category: String = row.get(5)?;
    let created_at: String = row.get(6)?;

    Ok(DeadEnd {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        approach: row.get(2)?,
        structural_constraint: row.get(3)?,
        sub_type: row.get(4)?,
        category: DeadEndCategory::from_str(&category),
        created_at: parse_timestamp(&created_at),
    })
}
