// 📈 Summary statistics per (backend, operation, cache mode)

use super::record::BenchmarkRunRecord;
use super::CacheMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub backend: String,
    pub operation: String,
    pub cache_mode: CacheMode,
    pub runs: usize,
    pub failures: usize,

    // Durations over successful runs only; None when every run failed
    pub min_ms: Option<f64>,
    pub median_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub mean_ms: Option<f64>,

    /// Rows processed per second across successful runs
    pub throughput: f64,

    /// Highest process RSS seen by any successful run
    #[serde(default)]
    pub peak_rss_bytes: u64,
}

/// Summaries ordered by (backend, operation, cache mode)
pub fn summarize(records: &[BenchmarkRunRecord]) -> Vec<OperationSummary> {
    let mut groups: BTreeMap<(String, String, CacheMode), Vec<&BenchmarkRunRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry((record.backend.clone(), record.operation.clone(), record.cache_mode))
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .map(|((backend, operation, cache_mode), runs)| {
            let mut durations: Vec<f64> = runs
                .iter()
                .filter(|r| r.success)
                .map(|r| r.elapsed_ms)
                .collect();
            durations.sort_by(|a, b| a.total_cmp(b));

            let rows: u64 = runs.iter().filter(|r| r.success).map(|r| r.rows_processed).sum();
            let total_ms: f64 = durations.iter().sum();
            let throughput = if total_ms > 0.0 {
                rows as f64 * 1000.0 / total_ms
            } else {
                0.0
            };

            OperationSummary {
                backend,
                operation,
                cache_mode,
                runs: runs.len(),
                failures: runs.iter().filter(|r| !r.success).count(),
                min_ms: durations.first().copied(),
                median_ms: median(&durations),
                p95_ms: percentile(&durations, 0.95),
                mean_ms: mean(&durations),
                throughput,
                peak_rss_bytes: runs
                    .iter()
                    .filter(|r| r.success)
                    .map(|r| r.peak_rss_bytes)
                    .max()
                    .unwrap_or(0),
            }
        })
        .collect()
}

/// Middle value; mean of the two middle values for even counts. Input sorted.
pub fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    }
}

/// Nearest-rank percentile. Input sorted.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    let idx = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[idx])
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
