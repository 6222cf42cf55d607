//! # Project Configuration
//!
//! `.crucible/config.json`. Every section is optional; anything missing is
//! filled from defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::metrics::MetricsConfig;
use crate::models::ModelConfig;

pub const CONFIG_FILE: &str = "config.json";

/// Lifecycle rules that can be relaxed per project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub require_doubt_before_verify: bool,
    /// When false the policy treats challenges as already present
    pub require_challenge_before_verify: bool,
    /// Dead-ends per sub_type before the breaker trips
    pub circuit_breaker_threshold: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            require_doubt_before_verify: true,
            require_challenge_before_verify: true,
            circuit_breaker_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSettings {
    pub max_parallel: usize,
    pub max_steps: u32,
    /// Leave worktrees on disk after the run
    pub keep_worktrees: bool,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            max_steps: 20,
            keep_worktrees: false,
        }
    }
}

/// Command that performs a stage; the stage arrives via environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// argv; empty means no worker is configured
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrucibleConfig {
    pub metrics: MetricsConfig,
    pub cycle: CycleConfig,
    pub swarm: SwarmSettings,
    pub worker: WorkerConfig,
    pub interpreter: ModelConfig,
}

impl CrucibleConfig {
    pub fn path_in(runtime_dir: &Path) -> PathBuf {
        runtime_dir.join(CONFIG_FILE)
    }

    /// Load from `runtime_dir`; a missing file yields defaults
    pub async fn load(runtime_dir: &Path) -> Result<Self> {
        let path = Self::path_in(runtime_dir);
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid config: {:?}", path))
    }

    pub async fn save(&self, runtime_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(runtime_dir)
            .await
            .with_context(|| format!("Failed to create runtime directory: {:?}", runtime_dir))?;
        let path = Self::path_in(runtime_dir);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write config: {:?}", path))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: CrucibleConfig =
            serde_json::from_str(r#"{"swarm": {"max_parallel": 8}, "cycle": {"circuit_breaker_threshold": 5}}"#)
                .unwrap();
        assert_eq!(config.swarm.max_parallel, 8);
        assert_eq!(config.swarm.max_steps, 20);
        assert_eq!(config.cycle.circuit_breaker_threshold, 5);
        assert!(config.cycle.require_challenge_before_verify);
        assert!(config.worker.command.is_empty());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = tokio_test::block_on(CrucibleConfig::load(dir.path())).unwrap();
        assert_eq!(config, CrucibleConfig::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CrucibleConfig::default();
        config.worker.command = vec!["./worker.sh".to_string()];
        config.swarm.keep_worktrees = true;

        config.save(dir.path()).await.unwrap();
        let loaded = CrucibleConfig::load(dir.path()).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(CrucibleConfig::path_in(dir.path()), "{ nope")
            .await
            .unwrap();
        assert!(CrucibleConfig::load(dir.path()).await.is_err());
    }
}
