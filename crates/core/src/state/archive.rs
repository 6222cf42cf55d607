//! # Instance Archive
//!
//! Swarm instances keep their records in a database inside their worktree.
//! Before a worktree is removed its rows are copied into the project
//! database, so experiments, dead-ends, grades and metrics outlive it.

use super::db::{lock, CrucibleDb};
use crate::lifecycle::ExperimentStatus;
use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;

/// What an import copied
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Slugs as stored in the target (suffixed when they collided)
    pub experiments: Vec<String>,
    pub dead_ends: usize,
    /// At least one imported experiment reached `merged`
    pub merged: bool,
}

struct ExperimentRow {
    id: i64,
    slug: String,
    branch: String,
    hypothesis: String,
    status: String,
    sub_type: Option<String>,
    grade: Option<String>,
    parent_id: Option<i64>,
    created_at: String,
    updated_at: String,
}

/// Copy every experiment of `source` and everything attached to it into
/// `target`, in one transaction. Timestamps are preserved; ids are
/// reassigned and slugs that already exist in `target` get a `-N` suffix.
pub fn import_instance(target: &CrucibleDb, source: &CrucibleDb) -> Result<ImportSummary> {
    let source_conn = source.connection();
    let source = lock(&source_conn)?;
    let target_conn = target.connection();
    let mut target = lock(&target_conn)?;
    let tx = target.transaction()?;

    let mut summary = ImportSummary::default();
    let mut experiment_ids: HashMap<i64, i64> = HashMap::new();

    for row in experiment_rows(&source)? {
        let slug = unique_slug(&tx, &row.slug)?;
        let parent_id = row.parent_id.and_then(|p| experiment_ids.get(&p).copied());
        tx.execute(
            r#"
            INSERT INTO experiments (slug, branch, hypothesis, status, sub_type, grade, parent_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                slug,
                row.branch,
                row.hypothesis,
                row.status,
                row.sub_type,
                row.grade,
                parent_id,
                row.created_at,
                row.updated_at,
            ],
        )
        .with_context(|| format!("Failed to import experiment '{}'", row.slug))?;
        experiment_ids.insert(row.id, tx.last_insert_rowid());

        summary.merged |= row.status == ExperimentStatus::Merged.as_str();
        summary.experiments.push(slug);
    }

    summary.dead_ends = copy_rows(
        &source,
        &tx,
        "dead_ends",
        &["approach", "structural_constraint", "sub_type", "category", "created_at"],
        &experiment_ids,
    )?;
    copy_rows(
        &source,
        &tx,
        "decisions",
        &["evidence_level", "description", "created_at"],
        &experiment_ids,
    )?;
    copy_rows(
        &source,
        &tx,
        "doubts",
        &["description", "severity", "created_at"],
        &experiment_ids,
    )?;
    copy_rows(
        &source,
        &tx,
        "challenges",
        &["description", "created_at"],
        &experiment_ids,
    )?;
    copy_rows(
        &source,
        &tx,
        "metrics",
        &["phase", "fixture", "metric_name", "value", "captured_at"],
        &experiment_ids,
    )?;
    copy_verifications(&source, &tx, &experiment_ids)?;

    tx.commit().context("Failed to commit instance import")?;
    tracing::debug!(
        experiments = summary.experiments.len(),
        dead_ends = summary.dead_ends,
        merged = summary.merged,
        "Instance records imported"
    );
    Ok(summary)
}

fn experiment_rows(conn: &Connection) -> Result<Vec<ExperimentRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, slug, branch, hypothesis, status, sub_type, grade, parent_id, created_at, updated_at \
         FROM experiments ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ExperimentRow {
                id: row.get(0)?,
                slug: row.get(1)?,
                branch: row.get(2)?,
                hypothesis: row.get(3)?,
                status: row.get(4)?,
                sub_type: row.get(5)?,
                grade: row.get(6)?,
                parent_id: row.get(7)?,
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn unique_slug(conn: &Connection, slug: &str) -> Result<String> {
    let taken = |candidate: &str| -> Result<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM experiments WHERE slug = ?1",
                params![candidate],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    };

    if !taken(slug)? {
        return Ok(slug.to_string());
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", slug, n);
        if !taken(&candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Copy `experiment_id` plus `columns` of every row in `table`
fn copy_rows(
    source: &Connection,
    target: &Connection,
    table: &str,
    columns: &[&str],
    experiment_ids: &HashMap<i64, i64>,
) -> Result<usize> {
    let column_list = columns.join(", ");
    let placeholders = (1..=columns.len() + 1)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");

    let mut select = source.prepare(&format!(
        "SELECT experiment_id, {} FROM {} ORDER BY rowid",
        column_list, table
    ))?;
    let mut insert = target.prepare(&format!(
        "INSERT INTO {} (experiment_id, {}) VALUES ({})",
        table, column_list, placeholders
    ))?;

    let mut rows = select.query([])?;
    let mut copied = 0;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len() + 1);
        values.push(remap(row.get(0)?, experiment_ids, table)?);
        for i in 1..=columns.len() {
            values.push(row.get::<_, Value>(i)?);
        }
        insert
            .execute(params_from_iter(values))
            .with_context(|| format!("Failed to import {} row", table))?;
        copied += 1;
    }
    Ok(copied)
}

fn copy_verifications(
    source: &Connection,
    target: &Connection,
    experiment_ids: &HashMap<i64, i64>,
) -> Result<()> {
    let mut round_ids: HashMap<i64, i64> = HashMap::new();
    let mut rounds = source
        .prepare("SELECT id, experiment_id, started_at FROM verification_rounds ORDER BY id")?;
    let mut rows = rounds.query([])?;
    while let Some(row) = rows.next()? {
        let experiment_id = remap(row.get(1)?, experiment_ids, "verification_rounds")?;
        target.execute(
            "INSERT INTO verification_rounds (experiment_id, started_at) VALUES (?1, ?2)",
            params![experiment_id, row.get::<_, String>(2)?],
        )?;
        round_ids.insert(row.get(0)?, target.last_insert_rowid());
    }

    let mut grades = source.prepare(
        "SELECT experiment_id, round_id, component, grade, created_at FROM verifications ORDER BY id",
    )?;
    let mut rows = grades.query([])?;
    while let Some(row) = rows.next()? {
        let round_id: i64 = row.get(1)?;
        let round_id = round_ids
            .get(&round_id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Verification references unknown round {}", round_id))?;
        target.execute(
            "INSERT INTO verifications (experiment_id, round_id, component, grade, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                remap(row.get(0)?, experiment_ids, "verifications")?,
                round_id,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ],
        )?;
    }
    Ok(())
}

/// Map a source `experiment_id` onto the target; NULL stays NULL
fn remap(value: Value, experiment_ids: &HashMap<i64, i64>, table: &str) -> Result<Value> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Integer(old) => experiment_ids
            .get(&old)
            .map(|&new| Value::Integer(new))
            .ok_or_else(|| anyhow::anyhow!("{} row references unknown experiment {}", table, old)),
        other => anyhow::bail!("{} row has a non-integer experiment id: {:?}", table, other),
    }
}
