// 🧾 Benchmark Run Records - One immutable row per measured run
//
// A PendingRun is opened when an operation starts and consumed exactly
// once by finish_ok / finish_err. The resulting record is appended to the
// result store and never touched again.

use super::CacheMode;
use crate::backend::Support;
use crate::error::{GraphError, GraphResult};
use crate::traversal::{BranchStops, QueryClass};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::warn;

/// Resident set size sampling period while a run is in flight
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRunRecord {
    /// Unique per record
    #[serde(default)]
    pub record_id: String,
    /// Shared by every record of one harness run
    pub run_id: String,
    pub operation: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_class: Option<QueryClass>,

    pub backend: String,
    pub cache_mode: CacheMode,

    /// 1-based; warm-up runs are never recorded
    pub repetition: usize,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: f64,

    // ========================================================================
    // METRICS
    // ========================================================================
    /// Input records for builds, rows examined for traversals
    pub rows_processed: u64,
    pub nodes: u64,
    pub edges: u64,
    pub result_items: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support: Option<Support>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_stops: Option<BranchStops>,

    // Process-wide figures: concurrent workers share one process
    /// Highest resident set size sampled during the run
    #[serde(default)]
    pub peak_rss_bytes: u64,
    /// Resident set size after the run minus before it
    pub memory_delta_bytes: i64,
    /// CPU time consumed by the process over the run
    #[serde(default)]
    pub cpu_seconds: f64,

    /// Stored graph size after a build, for file-backed stores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_bytes: Option<u64>,

    // ========================================================================
    // OUTCOME
    // ========================================================================
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BenchmarkRunRecord {
    /// Rows processed per second, 0 when nothing was timed
    pub fn rows_per_second(&self) -> f64 {
        if self.elapsed_ms > 0.0 && self.rows_processed > 0 {
            self.rows_processed as f64 * 1000.0 / self.elapsed_ms
        } else {
            0.0
        }
    }
}

/// What a successful run measured
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunMetrics {
    pub rows_processed: u64,
    pub nodes: u64,
    pub edges: u64,
    pub result_items: u64,
    pub support: Option<Support>,
    pub stops: Option<BranchStops>,
    pub disk_bytes: Option<u64>,
}

// ============================================================================
// PENDING RUN
// ============================================================================

pub struct PendingRun<'a> {
    run_id: String,
    operation: String,
    query_class: Option<QueryClass>,
    backend: String,
    cache_mode: CacheMode,
    repetition: usize,
    started_at: DateTime<Utc>,
    clock: Instant,
    sampling: Sampling,
    sampler: &'a ResourceSampler,
}

impl<'a> PendingRun<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        run_id: &str,
        operation: &str,
        query_class: Option<QueryClass>,
        backend: &str,
        cache_mode: CacheMode,
        repetition: usize,
        sampler: &'a ResourceSampler,
    ) -> Self {
        let sampling = sampler.begin();
        PendingRun {
            run_id: run_id.to_string(),
            operation: operation.to_string(),
            query_class,
            backend: backend.to_string(),
            cache_mode,
            repetition,
            started_at: Utc::now(),
            clock: Instant::now(),
            sampling,
            sampler,
        }
    }

    pub fn finish_ok(self, metrics: RunMetrics) -> BenchmarkRunRecord {
        let mut record = self.finish(true, None, None);
        record.rows_processed = metrics.rows_processed;
        record.nodes = metrics.nodes;
        record.edges = metrics.edges;
        record.result_items = metrics.result_items;
        record.support = metrics.support;
        record.branch_stops = metrics.stops;
        record.disk_bytes = metrics.disk_bytes;
        record
    }

    pub fn finish_err(self, err: &GraphError) -> BenchmarkRunRecord {
        let kind = err.error_kind().to_string();
        self.finish(false, Some(kind), Some(err.to_string()))
    }

    /// Failure that never produced a GraphError (a panicking worker)
    pub fn finish_failed(self, kind: &str, message: String) -> BenchmarkRunRecord {
        self.finish(false, Some(kind.to_string()), Some(message))
    }

    fn finish(self, success: bool, error_kind: Option<String>, error: Option<String>) -> BenchmarkRunRecord {
        let elapsed_ms = self.clock.elapsed().as_secs_f64() * 1000.0;
        let finished_at = Utc::now();
        let usage = self.sampler.end(self.sampling);

        BenchmarkRunRecord {
            record_id: uuid::Uuid::new_v4().to_string(),
            run_id: self.run_id,
            operation: self.operation,
            query_class: self.query_class,
            backend: self.backend,
            cache_mode: self.cache_mode,
            repetition: self.repetition,
            started_at: self.started_at,
            finished_at,
            elapsed_ms,
            rows_processed: 0,
            nodes: 0,
            edges: 0,
            result_items: 0,
            support: None,
            branch_stops: None,
            peak_rss_bytes: usage.peak_rss_bytes,
            memory_delta_bytes: usage.memory_delta_bytes,
            cpu_seconds: usage.cpu_seconds,
            disk_bytes: None,
            success,
            error_kind,
            error,
        }
    }
}

// ============================================================================
// RESOURCE SAMPLER
// ============================================================================

/// Resources one run consumed, as seen from this process
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub peak_rss_bytes: u64,
    pub memory_delta_bytes: i64,
    pub cpu_seconds: f64,
}

/// One in-flight measurement; a background thread samples RSS until `end`
pub struct Sampling {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<(u64, u64)>>,
    rss_before: u64,
    since: Instant,
}

impl Drop for Sampling {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = &self.thread {
            handle.thread().unpark();
        }
    }
}

/// Samples this process's memory and CPU; one sampler per benchmark worker
pub struct ResourceSampler {
    pid: Option<Pid>,
    interval: Duration,
    /// Per-process CPU usage is only computed on a full process refresh
    cpu: Mutex<System>,
}

fn refresh_rss(system: &mut System, pid: Pid) -> u64 {
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), ProcessRefreshKind::new().with_memory());
    system.process(pid).map_or(0, |p| p.memory())
}

impl ResourceSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Process resource sampling disabled: {}", e);
                None
            }
        };
        ResourceSampler {
            pid,
            interval: SAMPLE_INTERVAL,
            cpu: Mutex::new(System::new()),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// CPU usage of this process since the previous call, in percent of one core
    fn cpu_percent(&self) -> f32 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let mut system = match self.cpu.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes_specifics(ProcessesToUpdate::All, ProcessRefreshKind::new().with_cpu());
        system.process(pid).map_or(0.0, |p| p.cpu_usage())
    }

    pub fn begin(&self) -> Sampling {
        self.cpu_percent();
        let stop = Arc::new(AtomicBool::new(false));

        let Some(pid) = self.pid else {
            return Sampling {
                stop,
                thread: None,
                rss_before: 0,
                since: Instant::now(),
            };
        };

        let mut system = System::new();
        let rss_before = refresh_rss(&mut system, pid);
        let flag = Arc::clone(&stop);
        let interval = self.interval;

        let thread = thread::Builder::new()
            .name("rss-sampler".to_string())
            .spawn(move || {
                let mut peak = rss_before;
                let mut last = rss_before;
                while !flag.load(Ordering::Acquire) {
                    thread::park_timeout(interval);
                    last = refresh_rss(&mut system, pid);
                    peak = peak.max(last);
                }
                (peak, last)
            });
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Could not start RSS sampler: {}", e);
                None
            }
        };

        Sampling {
            stop,
            thread,
            rss_before,
            since: Instant::now(),
        }
    }

    pub fn end(&self, mut sampling: Sampling) -> ResourceUsage {
        sampling.stop.store(true, Ordering::Release);
        let (peak, last) = match sampling.thread.take() {
            Some(handle) => {
                handle.thread().unpark();
                handle.join().unwrap_or((sampling.rss_before, sampling.rss_before))
            }
            None => (sampling.rss_before, sampling.rss_before),
        };

        let seconds = sampling.since.elapsed().as_secs_f64();
        let cpu_seconds = f64::from(self.cpu_percent()) / 100.0 * seconds;

        ResourceUsage {
            peak_rss_bytes: peak,
            memory_delta_bytes: last as i64 - sampling.rss_before as i64,
            cpu_seconds,
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        ResourceSampler::new()
    }
}

// ============================================================================
// RESULT STORE (JSON Lines)
// ============================================================================

pub struct ResultStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ResultStore {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a JSON line
    pub fn append(&self, record: &BenchmarkRunRecord) -> GraphResult<()> {
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Result store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Every record in the file, in append order
    pub fn load(&self) -> GraphResult<Vec<BenchmarkRunRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: &str = "run-1";

    #[test]
    fn test_pending_run_finishes_once_with_metrics() {
        let sampler = ResourceSampler::new();
        let pending = PendingRun::start(RUN, "referral_chain", Some(QueryClass::ReferralChain), "sqlite", CacheMode::Warm, 2, &sampler);

        let stops = BranchStops {
            depth_limit: 2,
            ..BranchStops::default()
        };
        let record = pending.finish_ok(RunMetrics {
            rows_processed: 120,
            nodes: 4,
            edges: 3,
            result_items: 3,
            support: Some(Support::Native),
            stops: Some(stops),
            disk_bytes: None,
        });

        assert!(record.success);
        assert_eq!(record.run_id, RUN);
        assert_eq!(record.repetition, 2);
        assert_eq!(record.result_items, 3);
        assert_eq!(record.branch_stops, Some(stops));
        assert!(record.finished_at >= record.started_at);
        assert!(record.error_kind.is_none());
    }

    #[test]
    fn test_failed_run_carries_error_kind() {
        let sampler = ResourceSampler::new();
        let pending = PendingRun::start(RUN, "build", None, "columnar", CacheMode::Cold, 1, &sampler);

        let record = pending.finish_err(&GraphError::unavailable("columnar", "offline"));

        assert!(!record.success);
        assert_eq!(record.error_kind.as_deref(), Some("BackendUnavailable"));
        assert!(record.error.unwrap().contains("offline"));
        assert_eq!(record.rows_processed, 0);
        assert_eq!(record.disk_bytes, None);
    }

    #[test]
    fn test_record_ids_are_unique_within_a_run() {
        let sampler = ResourceSampler::new();
        let first = PendingRun::start(RUN, "build", None, "sqlite", CacheMode::Cold, 1, &sampler)
            .finish_ok(RunMetrics::default());
        let second = PendingRun::start(RUN, "build", None, "sqlite", CacheMode::Cold, 2, &sampler)
            .finish_ok(RunMetrics::default());

        assert_eq!(first.run_id, second.run_id);
        assert_ne!(first.record_id, second.record_id);
    }

    #[test]
    fn test_sampler_sees_process_memory() {
        let sampler = ResourceSampler::new().with_interval(Duration::from_millis(5));
        let sampling = sampler.begin();

        let held = vec![1u8; 64 << 20];
        thread::sleep(Duration::from_millis(100));
        let usage = sampler.end(sampling);
        assert_eq!(held.len(), 64 << 20);

        assert!(usage.peak_rss_bytes >= 64 << 20, "peak {} below the held buffer", usage.peak_rss_bytes);
        assert!(usage.cpu_seconds >= 0.0);

        println!("✅ Process resource sampling PASSED");
    }

    #[test]
    fn test_result_store_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path().join("results").join("runs.jsonl"));
        let sampler = ResourceSampler::new();

        assert!(store.load().unwrap().is_empty());

        let first = PendingRun::start(RUN, "build", None, "sqlite", CacheMode::Cold, 1, &sampler)
            .finish_ok(RunMetrics {
                disk_bytes: Some(8192),
                ..RunMetrics::default()
            });
        let second = PendingRun::start(RUN, "clustering", Some(QueryClass::Clustering), "sqlite", CacheMode::Cold, 1, &sampler)
            .finish_err(&GraphError::EmptyInput);
        store.append(&first).unwrap();
        store.append(&second).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].record_id, first.record_id);
        assert_eq!(loaded[0].disk_bytes, Some(8192));
        assert_eq!(loaded[1].record_id, second.record_id);
        assert_eq!(loaded[1].run_id, RUN);
        assert_eq!(loaded[1].error_kind.as_deref(), Some("EmptyInput"));
        assert_eq!(loaded[1].query_class, Some(QueryClass::Clustering));

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn test_rows_per_second() {
        let sampler = ResourceSampler::new();
        let mut record = PendingRun::start(RUN, "build", None, "sqlite", CacheMode::Cold, 1, &sampler)
            .finish_ok(RunMetrics {
                rows_processed: 500,
                ..RunMetrics::default()
            });
        record.elapsed_ms = 250.0;

        assert_eq!(record.rows_per_second(), 2000.0);
    }
}
