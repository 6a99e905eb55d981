// 🏁 Benchmark Harness - Measured runs per backend, isolated failures
//
// One scoped worker thread per backend; runs against the same backend are
// sequential. Every measured run produces exactly one BenchmarkRunRecord,
// successful or not.

pub mod record;
pub mod stats;
pub mod workload;

pub use record::{BenchmarkRunRecord, PendingRun, ResourceSampler, ResourceUsage, ResultStore, RunMetrics};
pub use stats::{summarize, OperationSummary};
pub use workload::{Operation, Workload, BUILD_OPERATION};

use crate::backend::{BackendAdapter, BackendFactory};
use crate::config::BenchConfig;
use crate::error::{GraphError, GraphResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const WORKER_PANIC: &str = "WorkerPanic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Fresh connection and dropped caches for every repetition
    Cold,
    /// One connection, one unrecorded warm-up, then the repetitions
    Warm,
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheMode::Cold => f.write_str("cold"),
            CacheMode::Warm => f.write_str("warm"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessOptions {
    pub repetitions: usize,
    pub cache_modes: Vec<CacheMode>,
    /// Applied to every build and traversal
    pub timeout: Duration,
}

impl HarnessOptions {
    pub fn from_config(config: &BenchConfig) -> Self {
        HarnessOptions {
            repetitions: config.repetitions,
            cache_modes: config.cache_modes.clone(),
            timeout: config.timeout(),
        }
    }
}

impl Default for HarnessOptions {
    fn default() -> Self {
        HarnessOptions::from_config(&BenchConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: Vec<BenchmarkRunRecord>,
    pub summaries: Vec<OperationSummary>,
}

impl BenchmarkReport {
    pub fn failures(&self) -> usize {
        self.records.iter().filter(|r| !r.success).count()
    }

    pub fn records_for<'a>(&'a self, backend: &'a str) -> impl Iterator<Item = &'a BenchmarkRunRecord> + 'a {
        self.records.iter().filter(move |r| r.backend == backend)
    }
}

/// What the harness does after a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    /// Skip the remaining repetitions of this (operation, mode)
    SkipMode,
    /// Stop measuring this backend
    AbortBackend,
}

impl Step {
    fn after_failure(operation: &Operation, err: &GraphError) -> Step {
        if err.is_backend_fatal() || operation.is_build() {
            Step::AbortBackend
        } else {
            Step::SkipMode
        }
    }
}

/// Collects records from every worker and mirrors them to the store
struct Recorder<'a> {
    run_id: String,
    sink: Mutex<Vec<BenchmarkRunRecord>>,
    store: Option<&'a ResultStore>,
}

impl<'a> Recorder<'a> {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn record(&self, record: BenchmarkRunRecord) {
        if record.success {
            debug!(
                backend = %record.backend,
                operation = %record.operation,
                cache_mode = %record.cache_mode,
                repetition = record.repetition,
                elapsed_ms = record.elapsed_ms,
                "Run recorded"
            );
        } else {
            warn!(
                backend = %record.backend,
                operation = %record.operation,
                cache_mode = %record.cache_mode,
                repetition = record.repetition,
                error = record.error.as_deref().unwrap_or(""),
                "Run failed"
            );
        }

        if let Some(store) = self.store {
            if let Err(e) = store.append(&record) {
                warn!(path = ?store.path(), "Failed to persist run record: {}", e);
            }
        }

        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sink.push(record);
    }

    fn into_records(self) -> Vec<BenchmarkRunRecord> {
        match self.sink.into_inner() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct BenchmarkHarness {
    options: HarnessOptions,
    store: Option<ResultStore>,
}

impl BenchmarkHarness {
    pub fn new(options: HarnessOptions) -> Self {
        BenchmarkHarness {
            options,
            store: None,
        }
    }

    /// Append every record to a JSON Lines store as it is produced
    pub fn with_store(mut self, store: ResultStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn options(&self) -> &HarnessOptions {
        &self.options
    }

    /// Measure the workload on every target; backends run concurrently
    pub fn run(&self, workload: &Workload, targets: &[&dyn BackendFactory]) -> BenchmarkReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(
            run_id = %run_id,
            backends = targets.len(),
            operations = workload.operations.len(),
            repetitions = self.options.repetitions,
            "Starting benchmark"
        );

        let recorder = Recorder {
            run_id: run_id.clone(),
            sink: Mutex::new(Vec::new()),
            store: self.store.as_ref(),
        };

        thread::scope(|scope| {
            let workers: Vec<_> = targets
                .iter()
                .map(|factory| {
                    let recorder = &recorder;
                    let handle = scope.spawn(move || self.run_target(*factory, workload, recorder));
                    (factory.name().to_string(), handle)
                })
                .collect();

            for (backend, handle) in workers {
                if let Err(payload) = handle.join() {
                    let message = panic_message(payload.as_ref());
                    error!(backend = %backend, "Benchmark worker panicked: {}", message);
                    let sampler = ResourceSampler::new();
                    let mode = self.options.cache_modes.first().copied().unwrap_or(CacheMode::Cold);
                    recorder.record(
                        PendingRun::start(recorder.run_id(), "worker", None, &backend, mode, 0, &sampler)
                            .finish_failed(WORKER_PANIC, message),
                    );
                }
            }
        });

        let records = recorder.into_records();
        let summaries = summarize(&records);
        let report = BenchmarkReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            records,
            summaries,
        };

        info!(
            run_id = %report.run_id,
            records = report.records.len(),
            failures = report.failures(),
            "Benchmark finished"
        );
        report
    }

    fn run_target(&self, factory: &dyn BackendFactory, workload: &Workload, recorder: &Recorder<'_>) {
        let sampler = ResourceSampler::new();
        info!(backend = factory.name(), "Benchmarking backend");

        'operations: for operation in &workload.operations {
            for mode in &self.options.cache_modes {
                let step = match mode {
                    CacheMode::Cold => self.run_cold(factory, operation, workload, &sampler, recorder),
                    CacheMode::Warm => self.run_warm(factory, operation, workload, &sampler, recorder),
                };
                if step == Step::AbortBackend {
                    warn!(
                        backend = factory.name(),
                        operation = operation.name(),
                        "Aborting remaining measurements for backend"
                    );
                    break 'operations;
                }
            }
        }
    }

    fn run_cold(
        &self,
        factory: &dyn BackendFactory,
        operation: &Operation,
        workload: &Workload,
        sampler: &ResourceSampler,
        recorder: &Recorder<'_>,
    ) -> Step {
        for repetition in 1..=self.options.repetitions {
            let adapter = match factory.connect().and_then(|adapter| {
                adapter.drop_caches()?;
                Ok(adapter)
            }) {
                Ok(adapter) => adapter,
                Err(e) => {
                    return self.record_setup_failure(factory, operation, CacheMode::Cold, repetition, sampler, recorder, e)
                }
            };

            let step = self.measure(&adapter, operation, workload, CacheMode::Cold, repetition, sampler, recorder);
            if step != Step::Continue {
                return step;
            }
        }
        Step::Continue
    }

    fn run_warm(
        &self,
        factory: &dyn BackendFactory,
        operation: &Operation,
        workload: &Workload,
        sampler: &ResourceSampler,
        recorder: &Recorder<'_>,
    ) -> Step {
        let adapter = match factory.connect() {
            Ok(adapter) => adapter,
            Err(e) => return self.record_setup_failure(factory, operation, CacheMode::Warm, 1, sampler, recorder, e),
        };

        // Warm-up is never recorded; a real failure shows up in the first repetition
        if let Err(e) = self.execute(&adapter, operation, workload) {
            debug!(backend = adapter.name(), operation = operation.name(), "Warm-up failed: {}", e);
        }

        for repetition in 1..=self.options.repetitions {
            let step = self.measure(&adapter, operation, workload, CacheMode::Warm, repetition, sampler, recorder);
            if step != Step::Continue {
                return step;
            }
        }
        Step::Continue
    }

    #[allow(clippy::too_many_arguments)]
    fn record_setup_failure(
        &self,
        factory: &dyn BackendFactory,
        operation: &Operation,
        mode: CacheMode,
        repetition: usize,
        sampler: &ResourceSampler,
        recorder: &Recorder<'_>,
        err: GraphError,
    ) -> Step {
        let pending = PendingRun::start(
            recorder.run_id(),
            operation.name(),
            operation.query_class(),
            factory.name(),
            mode,
            repetition,
            sampler,
        );
        recorder.record(pending.finish_err(&err));
        Step::after_failure(operation, &err)
    }

    #[allow(clippy::too_many_arguments)]
    fn measure(
        &self,
        adapter: &BackendAdapter,
        operation: &Operation,
        workload: &Workload,
        mode: CacheMode,
        repetition: usize,
        sampler: &ResourceSampler,
        recorder: &Recorder<'_>,
    ) -> Step {
        // Graph size is read before the timed region
        let counts = if operation.is_build() {
            Ok((0, 0))
        } else {
            adapter.graph_counts()
        };

        let pending = PendingRun::start(
            recorder.run_id(),
            operation.name(),
            operation.query_class(),
            adapter.name(),
            mode,
            repetition,
            sampler,
        );
        let (nodes, edges) = match counts {
            Ok(counts) => counts,
            Err(e) => {
                recorder.record(pending.finish_err(&e));
                return Step::after_failure(operation, &e);
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(adapter, operation, workload)));
        match outcome {
            Ok(Ok(mut metrics)) => {
                if !operation.is_build() {
                    metrics.nodes = nodes;
                    metrics.edges = edges;
                }
                recorder.record(pending.finish_ok(metrics));
                Step::Continue
            }
            Ok(Err(e)) => {
                recorder.record(pending.finish_err(&e));
                Step::after_failure(operation, &e)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(backend = adapter.name(), operation = operation.name(), "Backend panicked: {}", message);
                recorder.record(pending.finish_failed(WORKER_PANIC, message));
                Step::AbortBackend
            }
        }
    }

    fn execute(&self, adapter: &BackendAdapter, operation: &Operation, workload: &Workload) -> GraphResult<RunMetrics> {
        match operation {
            Operation::Build => {
                let stats = adapter.execute_build(&workload.records, self.options.timeout)?;
                Ok(RunMetrics {
                    rows_processed: stats.records_seen,
                    nodes: stats.node_count,
                    edges: stats.edge_count,
                    result_items: stats.edge_count,
                    support: None,
                    stops: None,
                    disk_bytes: adapter.storage_bytes()?,
                })
            }
            Operation::Traversal { query, .. } => {
                let outcome = adapter.execute_traversal(query, self.options.timeout)?;
                Ok(RunMetrics {
                    rows_processed: outcome.rows_examined,
                    nodes: 0,
                    edges: 0,
                    result_items: outcome.result.item_count(),
                    support: Some(outcome.support),
                    stops: Some(outcome.stops),
                    disk_bytes: None,
                })
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
