//! # Metric Capture
//!
//! Runs the configured metrics command and turns its JSON into snapshots.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use tokio::process::Command;

use super::{MetricPhase, MetricSnapshot};
use crate::state::{CrucibleDb, MetricManager};

/// One numeric reading from the metrics command
#[derive(Debug, Clone, PartialEq)]
pub struct MetricReading {
    pub fixture: String,
    pub metric: String,
    pub value: f64,
}

/// Parse `{"fixtures": {fixture: {metric: number}}}`.
///
/// Non-numeric values are skipped; a missing or malformed `fixtures`
/// object is an error.
pub fn parse_metrics_output(output: &str) -> Result<Vec<MetricReading>> {
    let json: Value = serde_json::from_str(output.trim()).context("Metrics output is not JSON")?;
    let fixtures = json
        .get("fixtures")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow::anyhow!("Metrics output has no 'fixtures' object"))?;

    let mut readings = Vec::new();
    for (fixture, metrics) in fixtures {
        let Some(metrics) = metrics.as_object() else {
            tracing::debug!(fixture, "Skipping non-object fixture entry");
            continue;
        };
        for (metric, value) in metrics {
            match value.as_f64().filter(|v| v.is_finite()) {
                Some(value) => readings.push(MetricReading {
                    fixture: fixture.clone(),
                    metric: metric.clone(),
                    value,
                }),
                None => tracing::debug!(fixture, metric, "Skipping non-numeric metric"),
            }
        }
    }

    Ok(readings)
}

/// Run `command` in `cwd`, parse its output and store it as `phase` snapshots
#[tracing::instrument(skip(db, command))]
pub async fn capture_metrics(
    db: &CrucibleDb,
    experiment_id: i64,
    phase: MetricPhase,
    command: &str,
    cwd: &Path,
) -> Result<Vec<MetricSnapshot>> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .output()
        .await
        .with_context(|| format!("Failed to run metrics command: {}", command))?;

    if !output.status.success() {
        anyhow::bail!(
            "Metrics command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let snapshots: Vec<MetricSnapshot> = parse_metrics_output(&stdout)?
        .into_iter()
        .map(|reading| MetricSnapshot {
            experiment_id,
            phase,
            fixture: reading.fixture,
            metric: reading.metric,
            value: reading.value,
        })
        .collect();

    MetricManager::new(db).record(&snapshots)?;
    tracing::info!(count = snapshots.len(), "Captured metric snapshots");
    Ok(snapshots)
}
