// 🔌 Backend Adapter - One traversal surface over heterogeneous storage
//
// Each backend declares per query class whether it runs natively, through
// frontier-join emulation, or not at all. The adapter checks capability
// first, runs the query under a deadline and the rebuild gate, and
// discards results that finish after the deadline.

pub mod columnar;
pub mod sqlite;

use crate::builder::{BuildStats, GraphModelBuilder, GraphTables};
use crate::config::BenchConfig;
use crate::entities::BucketGranularity;
use crate::error::{GraphError, GraphResult};
use crate::records::ClaimRecord;
use crate::traversal::{
    BranchStops, ChainHit, ChainParams, ClusterParams, Clustering, Deadline, PathOutcome,
    PathParams, QueryClass, QueryContext, Ring, RingParams, TraversalQuery, TraversalResult,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

pub use columnar::{ColumnarFactory, ColumnarSession, ColumnarStore};
pub use sqlite::{SqliteBackend, SqliteFactory};

// ============================================================================
// CAPABILITIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Support {
    Native,
    Emulated,
    Unsupported,
}

impl fmt::Display for Support {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Support::Native => "native",
            Support::Emulated => "emulated",
            Support::Unsupported => "unsupported",
        };
        f.write_str(label)
    }
}

/// Storage engine behind an adapter. One instance = one connection/session.
pub trait GraphBackend: Send + Sync {
    fn name(&self) -> &str;

    fn support(&self, class: QueryClass) -> Support;

    fn health_check(&self) -> GraphResult<()>;

    /// Swap in a complete new graph; called only under the rebuild gate
    fn replace_graph(&self, tables: &GraphTables, deadline: &Deadline) -> GraphResult<()>;

    /// (nodes, edges) currently stored
    fn graph_counts(&self) -> GraphResult<(u64, u64)>;

    /// Release whatever this session cached between queries
    fn drop_caches(&self) -> GraphResult<()>;

    /// Bytes the stored graph occupies on disk; None for in-memory stores
    fn storage_bytes(&self) -> GraphResult<Option<u64>> {
        Ok(None)
    }

    fn referral_chain(&self, _params: &ChainParams, _ctx: &mut QueryContext) -> GraphResult<Vec<ChainHit>> {
        Err(self.unsupported(QueryClass::ReferralChain))
    }

    fn detect_rings(&self, _params: &RingParams, _ctx: &mut QueryContext) -> GraphResult<Vec<Ring>> {
        Err(self.unsupported(QueryClass::RingDetection))
    }

    fn shortest_path(&self, _params: &PathParams, _ctx: &mut QueryContext) -> GraphResult<PathOutcome> {
        Err(self.unsupported(QueryClass::ShortestPath))
    }

    fn cluster(&self, _params: &ClusterParams, _ctx: &mut QueryContext) -> GraphResult<Clustering> {
        Err(self.unsupported(QueryClass::Clustering))
    }

    fn unsupported(&self, class: QueryClass) -> GraphError {
        GraphError::CapabilityUnsupported {
            backend: self.name().to_string(),
            class,
        }
    }
}

// ============================================================================
// REBUILD GATE
// ============================================================================

/// Shared by every session of one backend. A rebuild holds the write side;
/// traversals never wait for it, they are turned away.
#[derive(Debug, Default)]
pub struct RebuildGate {
    lock: RwLock<()>,
    rebuilds: AtomicUsize,
}

pub struct RebuildGuard<'a> {
    gate: &'a RebuildGate,
    _exclusive: RwLockWriteGuard<'a, ()>,
}

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.gate.rebuilds.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RebuildGate {
    pub fn new() -> Self {
        RebuildGate::default()
    }

    /// Exclusive window; waits for in-flight traversals to finish
    pub fn begin_rebuild(&self) -> RebuildGuard<'_> {
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        let exclusive = match self.lock.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Rebuild gate was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        RebuildGuard {
            gate: self,
            _exclusive: exclusive,
        }
    }

    pub fn begin_read(&self, backend: &str) -> GraphResult<RwLockReadGuard<'_, ()>> {
        let in_progress = || GraphError::RebuildInProgress {
            backend: backend.to_string(),
        };
        if self.is_rebuilding() {
            return Err(in_progress());
        }
        match self.lock.try_read() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(in_progress()),
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("Rebuild gate was poisoned, recovering");
                Ok(poisoned.into_inner())
            }
        }
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilds.load(Ordering::SeqCst) > 0
    }
}

// ============================================================================
// ADAPTER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdapterOptions {
    /// Ceiling for any requested depth/hop bound
    pub max_depth: usize,

    /// When false, emulated classes are reported and treated as unsupported
    pub allow_emulation: bool,

    pub granularity: BucketGranularity,
}

impl AdapterOptions {
    pub fn from_config(config: &BenchConfig) -> Self {
        AdapterOptions {
            max_depth: config.max_depth,
            allow_emulation: config.allow_emulation,
            granularity: config.time_bucket,
        }
    }
}

impl Default for AdapterOptions {
    fn default() -> Self {
        AdapterOptions::from_config(&BenchConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraversalOutcome {
    pub result: TraversalResult,
    pub support: Support,
    pub rows_examined: u64,
    pub frontier_joins: u64,
    pub stops: BranchStops,
    pub elapsed: Duration,
}

pub struct BackendAdapter {
    backend: Box<dyn GraphBackend>,
    gate: std::sync::Arc<RebuildGate>,
    options: AdapterOptions,
    builder: GraphModelBuilder,
}

impl BackendAdapter {
    pub fn new(
        backend: Box<dyn GraphBackend>,
        gate: std::sync::Arc<RebuildGate>,
        options: AdapterOptions,
    ) -> Self {
        BackendAdapter {
            backend,
            gate,
            builder: GraphModelBuilder::new(options.granularity),
            options,
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn options(&self) -> &AdapterOptions {
        &self.options
    }

    /// Effective support, after the strict-native option is applied
    pub fn support(&self, class: QueryClass) -> Support {
        match self.backend.support(class) {
            Support::Emulated if !self.options.allow_emulation => Support::Unsupported,
            support => support,
        }
    }

    pub fn capabilities(&self) -> BTreeMap<QueryClass, Support> {
        QueryClass::ALL
            .iter()
            .map(|class| (*class, self.support(*class)))
            .collect()
    }

    pub fn graph_counts(&self) -> GraphResult<(u64, u64)> {
        self.backend.graph_counts()
    }

    pub fn drop_caches(&self) -> GraphResult<()> {
        self.backend.drop_caches()
    }

    pub fn health_check(&self) -> GraphResult<()> {
        self.backend.health_check()
    }

    pub fn storage_bytes(&self) -> GraphResult<Option<u64>> {
        self.backend.storage_bytes()
    }

    /// Build the graph model from records and replace the stored graph
    #[instrument(skip(self, records), fields(backend = %self.backend.name(), records = records.len()))]
    pub fn execute_build(&self, records: &[ClaimRecord], timeout: Duration) -> GraphResult<BuildStats> {
        let deadline = Deadline::after(timeout);
        let mut tables = self.builder.build(records)?;
        if deadline.expired() {
            return Err(GraphError::BuildTimeout {
                limit_ms: deadline.limit_ms(),
            });
        }

        let write_start = Instant::now();
        {
            let _exclusive = self.gate.begin_rebuild();
            self.backend.replace_graph(&tables, &deadline)?;
        }
        tables.stats.write_ms = write_start.elapsed().as_secs_f64() * 1000.0;

        info!(
            nodes = tables.stats.node_count,
            edges = tables.stats.edge_count,
            model_ms = tables.stats.model_ms,
            write_ms = tables.stats.write_ms,
            "Graph replaced"
        );
        Ok(tables.stats)
    }

    /// Run one traversal; fails fast on unsupported classes and bad bounds
    #[instrument(skip(self, query), fields(backend = %self.backend.name(), class = %query.class()))]
    pub fn execute_traversal(&self, query: &TraversalQuery, timeout: Duration) -> GraphResult<TraversalOutcome> {
        let class = query.class();
        let support = self.support(class);
        if support == Support::Unsupported {
            return Err(self.backend.unsupported(class));
        }
        query.validate(self.options.max_depth)?;

        let _shared = self.gate.begin_read(self.backend.name())?;
        let mut ctx = QueryContext::new(class, Deadline::after(timeout));
        let started = Instant::now();

        let result = match query {
            TraversalQuery::Chain(params) => {
                TraversalResult::Chain(self.backend.referral_chain(params, &mut ctx)?)
            }
            TraversalQuery::Rings(params) => {
                TraversalResult::Rings(self.backend.detect_rings(params, &mut ctx)?)
            }
            TraversalQuery::Path(params) => {
                TraversalResult::Path(self.backend.shortest_path(params, &mut ctx)?)
            }
            TraversalQuery::Cluster(params) => {
                TraversalResult::Clusters(self.backend.cluster(params, &mut ctx)?)
            }
        };

        // Finished, but too late: the result is discarded
        ctx.check()?;

        let elapsed = started.elapsed();
        debug!(
            %support,
            items = result.item_count(),
            rows = ctx.rows_examined,
            joins = ctx.frontier_joins,
            stops = ctx.stops.total(),
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Traversal finished"
        );

        Ok(TraversalOutcome {
            result,
            support,
            rows_examined: ctx.rows_examined,
            frontier_joins: ctx.frontier_joins,
            stops: ctx.stops,
            elapsed,
        })
    }
}

// ============================================================================
// FACTORIES (scoped acquisition)
// ============================================================================

/// Hands out one adapter per benchmark run; the adapter is dropped when the run ends
pub trait BackendFactory: Send + Sync {
    fn name(&self) -> &str;

    fn connect(&self) -> GraphResult<BackendAdapter>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::NodeKey;
    use std::sync::Arc;

    fn create_test_records() -> Vec<ClaimRecord> {
        vec![
            ClaimRecord::billed_for("P1", "Proc1", 10),
            ClaimRecord::billed_for("P1", "Proc2", 5),
            ClaimRecord::billed_for("P2", "Proc1", 3),
        ]
    }

    fn columnar_adapter(options: AdapterOptions) -> BackendAdapter {
        let factory = ColumnarFactory::new(Arc::new(ColumnarStore::new()), Arc::new(RebuildGate::new()), options);
        factory.connect().unwrap()
    }

    #[test]
    fn test_strict_native_reports_emulation_as_unsupported() {
        let strict = AdapterOptions {
            allow_emulation: false,
            ..AdapterOptions::default()
        };
        let adapter = columnar_adapter(strict);
        adapter.execute_build(&create_test_records(), Duration::from_secs(5)).unwrap();

        let caps = adapter.capabilities();
        assert_eq!(caps[&QueryClass::Clustering], Support::Native);
        assert_eq!(caps[&QueryClass::ReferralChain], Support::Unsupported);

        let query = TraversalQuery::Chain(ChainParams::new(NodeKey::provider("P1"), 2));
        let result = adapter.execute_traversal(&query, Duration::from_secs(5));
        assert!(matches!(result, Err(GraphError::CapabilityUnsupported { .. })));
    }

    #[test]
    fn test_depth_above_ceiling_is_invalid() {
        let adapter = columnar_adapter(AdapterOptions::default());
        adapter.execute_build(&create_test_records(), Duration::from_secs(5)).unwrap();

        let query = TraversalQuery::Chain(ChainParams::new(NodeKey::provider("P1"), 99));
        let result = adapter.execute_traversal(&query, Duration::from_secs(5));
        assert!(matches!(result, Err(GraphError::InvalidParameter(_))));
    }

    #[test]
    fn test_zero_timeout_discards_result() {
        let adapter = columnar_adapter(AdapterOptions::default());
        adapter.execute_build(&create_test_records(), Duration::from_secs(5)).unwrap();

        let query = TraversalQuery::Cluster(ClusterParams::new(1));
        let result = adapter.execute_traversal(&query, Duration::ZERO);
        assert!(matches!(result, Err(GraphError::TraversalTimeout { .. })));
    }

    #[test]
    fn test_traversal_rejected_during_rebuild() {
        let gate = Arc::new(RebuildGate::new());
        let store = Arc::new(ColumnarStore::new());
        let factory = ColumnarFactory::new(store, gate.clone(), AdapterOptions::default());
        let adapter = factory.connect().unwrap();
        adapter.execute_build(&create_test_records(), Duration::from_secs(5)).unwrap();

        let query = TraversalQuery::Cluster(ClusterParams::new(1));
        {
            let _rebuild = gate.begin_rebuild();
            let result = adapter.execute_traversal(&query, Duration::from_secs(5));
            assert!(matches!(result, Err(GraphError::RebuildInProgress { .. })));
        }

        assert!(!gate.is_rebuilding());
        assert!(adapter.execute_traversal(&query, Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_build_stats_carry_write_timing() {
        let adapter = columnar_adapter(AdapterOptions::default());
        let stats = adapter.execute_build(&create_test_records(), Duration::from_secs(5)).unwrap();

        assert_eq!(stats.node_count, 4);
        assert_eq!(stats.edge_count, 3);
        assert!(stats.write_ms >= 0.0);
        assert_eq!(adapter.graph_counts().unwrap(), (4, 3));
        assert_eq!(adapter.storage_bytes().unwrap(), None, "Columnar store lives in memory");
    }

    #[test]
    fn test_outcome_carries_branch_stops() {
        let adapter = columnar_adapter(AdapterOptions::default());
        adapter.execute_build(&create_test_records(), Duration::from_secs(5)).unwrap();

        let query = TraversalQuery::Chain(ChainParams::new(NodeKey::provider("P1"), 2));
        let outcome = adapter.execute_traversal(&query, Duration::from_secs(5)).unwrap();

        // P1 → {Proc1, Proc2} → P2; the walk ends with P2 at the depth bound
        assert_eq!(outcome.stops.depth_limit, 1);
        assert!(outcome.stops.cycle > 0, "Links back to reached nodes are refused");
    }
}
