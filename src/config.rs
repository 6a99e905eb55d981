// ⚙️ Benchmark Configuration - Settings as Data
// JSON file + environment overrides, every field has a default

use crate::bench::CacheMode;
use crate::entities::BucketGranularity;
use crate::traversal::RingWeight;
use anyhow::{bail, Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Depth/hop ceiling for chain, ring and path queries
    pub max_depth: usize,

    /// Per-operation timeout
    pub timeout_ms: u64,

    /// Minimum link weight (claims) kept by clustering, inclusive
    pub cluster_weight_threshold: u64,

    /// Recorded repetitions per (operation, cache mode)
    pub repetitions: usize,

    pub cache_modes: Vec<CacheMode>,

    pub ring_weight: RingWeight,

    pub time_bucket: BucketGranularity,

    /// When false, emulated traversal classes count as unsupported
    pub allow_emulation: bool,

    pub sqlite_path: PathBuf,

    pub results_path: PathBuf,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            max_depth: 6,
            timeout_ms: 30_000,
            cluster_weight_threshold: 100,
            repetitions: 3,
            cache_modes: vec![CacheMode::Cold, CacheMode::Warm],
            ring_weight: RingWeight::Sum,
            time_bucket: BucketGranularity::Month,
            allow_emulation: true,
            sqlite_path: PathBuf::from("data/claims_graph.db"),
            results_path: PathBuf::from("results/benchmark_runs.jsonl"),
        }
    }
}

impl BenchConfig {
    /// Load config from JSON file (missing fields take defaults)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: BenchConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;

        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any key lookup (tests pass a map)
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("GRAPHBENCH_MAX_DEPTH") {
            self.max_depth = parse_override("GRAPHBENCH_MAX_DEPTH", &value)?;
        }
        if let Some(value) = lookup("GRAPHBENCH_TIMEOUT_MS") {
            self.timeout_ms = parse_override("GRAPHBENCH_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("GRAPHBENCH_CLUSTER_THRESHOLD") {
            self.cluster_weight_threshold = parse_override("GRAPHBENCH_CLUSTER_THRESHOLD", &value)?;
        }
        if let Some(value) = lookup("BENCHMARK_RUNS") {
            self.repetitions = parse_override("BENCHMARK_RUNS", &value)?;
        }
        if let Some(value) = lookup("GRAPHBENCH_SQLITE_PATH") {
            self.sqlite_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("GRAPHBENCH_RESULTS_PATH") {
            self.results_path = PathBuf::from(value);
        }
        debug!(config = ?self, "Configuration after overrides");
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            bail!("max_depth must be at least 1");
        }
        if self.repetitions == 0 {
            bail!("repetitions must be at least 1");
        }
        if self.timeout_ms == 0 {
            bail!("timeout_ms must be greater than zero");
        }
        if self.cache_modes.is_empty() {
            bail!("cache_modes must list at least one mode");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid value {:?} for {}: {}", value, name, e))
}
