// 📊 Columnar backend - In-process column store without recursive queries
//
// Node and edge tables are held as parallel column vectors; edge columns are
// sorted by source so an outgoing frontier join is a range scan per node.
// Chain, ring and path queries run through the frontier engine; clustering
// is a native union-find pass over the edge columns.

use super::{AdapterOptions, BackendAdapter, BackendFactory, GraphBackend, RebuildGate, Support};
use crate::builder::GraphTables;
use crate::entities::{EntityKind, NodeId, NodeKey, RelationType};
use crate::error::{GraphError, GraphResult};
use crate::traversal::frontier::{self, FrontierSource, Link, LinkScope};
use crate::traversal::{
    ChainHit, ChainParams, ClusterParams, Clustering, Deadline, Direction, PathOutcome, PathParams,
    QueryClass, QueryContext, Ring, RingParams,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

pub const COLUMNAR_BACKEND: &str = "columnar";

// ============================================================================
// COLUMNS
// ============================================================================

#[derive(Debug, Default)]
pub struct ColumnarTables {
    // Node columns, sorted by id
    node_ids: Vec<NodeId>,
    node_kinds: Vec<EntityKind>,
    node_keys: Vec<String>,

    // Edge columns, sorted by (source, target, relation, bucket)
    edge_source: Vec<NodeId>,
    edge_target: Vec<NodeId>,
    edge_relation: Vec<RelationType>,
    edge_weight: Vec<u64>,
}

impl ColumnarTables {
    fn from_graph(tables: &GraphTables) -> Self {
        let mut columns = ColumnarTables::default();
        for node in &tables.nodes {
            columns.node_ids.push(node.id);
            columns.node_kinds.push(node.kind);
            columns.node_keys.push(node.natural_key.clone());
        }
        for edge in &tables.edges {
            columns.edge_source.push(edge.source_id);
            columns.edge_target.push(edge.target_id);
            columns.edge_relation.push(edge.relation);
            columns.edge_weight.push(edge.weight);
        }
        columns
    }

    fn node_index(&self, id: NodeId) -> Option<usize> {
        self.node_ids.binary_search(&id).ok()
    }

    fn node_key(&self, idx: usize) -> NodeKey {
        NodeKey {
            kind: self.node_kinds[idx],
            key: self.node_keys[idx].clone(),
        }
    }

    /// Row range of edges leaving `id`
    fn outgoing_rows(&self, id: NodeId) -> std::ops::Range<usize> {
        let start = self.edge_source.partition_point(|s| *s < id);
        let end = self.edge_source.partition_point(|s| *s <= id);
        start..end
    }

    /// Edge row permutation sorted by target, for incoming joins
    fn inbound_permutation(&self) -> Vec<usize> {
        let mut rows: Vec<usize> = (0..self.edge_target.len()).collect();
        rows.sort_by_key(|row| (self.edge_target[*row], self.edge_source[*row]));
        rows
    }
}

// ============================================================================
// STORE (shared by every session)
// ============================================================================

pub struct ColumnarStore {
    tables: RwLock<Arc<ColumnarTables>>,
}

impl ColumnarStore {
    pub fn new() -> Self {
        ColumnarStore {
            tables: RwLock::new(Arc::new(ColumnarTables::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<ColumnarTables> {
        match self.tables.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => {
                warn!("Columnar store lock was poisoned, recovering");
                Arc::clone(&poisoned.into_inner())
            }
        }
    }

    fn swap(&self, next: ColumnarTables) {
        let next = Arc::new(next);
        match self.tables.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => {
                warn!("Columnar store lock was poisoned, recovering");
                *poisoned.into_inner() = next;
            }
        }
    }
}

impl Default for ColumnarStore {
    fn default() -> Self {
        ColumnarStore::new()
    }
}

// ============================================================================
// SESSION
// ============================================================================

type InboundCache = Option<(Arc<ColumnarTables>, Arc<Vec<usize>>)>;

pub struct ColumnarSession {
    store: Arc<ColumnarStore>,
    /// Lazily built per session, rebuilt when the store swaps tables
    inbound: Mutex<InboundCache>,
}

impl ColumnarSession {
    pub fn new(store: Arc<ColumnarStore>) -> Self {
        ColumnarSession {
            store,
            inbound: Mutex::new(None),
        }
    }

    fn inbound(&self, tables: &Arc<ColumnarTables>) -> Arc<Vec<usize>> {
        let mut cache = match self.inbound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Columnar session cache was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        if let Some((cached_for, rows)) = cache.as_ref() {
            if Arc::ptr_eq(cached_for, tables) {
                return Arc::clone(rows);
            }
        }
        let rows = Arc::new(tables.inbound_permutation());
        *cache = Some((Arc::clone(tables), Arc::clone(&rows)));
        rows
    }

    /// Native weakly connected components over links with weight >= threshold
    fn union_find_components(&self, params: &ClusterParams, ctx: &mut QueryContext) -> GraphResult<Clustering> {
        let tables = self.store.snapshot();
        let mut uf = UnionFind::new(tables.node_ids.len());

        let mut row = 0;
        let edge_count = tables.edge_source.len();
        while row < edge_count {
            let (source, target) = (tables.edge_source[row], tables.edge_target[row]);
            let mut weight = 0u64;
            while row < edge_count && tables.edge_source[row] == source && tables.edge_target[row] == target {
                if params.relation.map_or(true, |r| r == tables.edge_relation[row]) {
                    weight += tables.edge_weight[row];
                }
                row += 1;
            }
            ctx.rows_examined += 1;

            if weight == 0 || weight < params.weight_threshold {
                continue;
            }
            if let (Some(a), Some(b)) = (tables.node_index(source), tables.node_index(target)) {
                uf.union(a, b);
            }
        }
        ctx.check()?;

        let mut groups: HashMap<usize, Vec<NodeKey>> = HashMap::new();
        for idx in 0..tables.node_ids.len() {
            groups.entry(uf.find(idx)).or_default().push(tables.node_key(idx));
        }
        debug!(components = groups.len(), "Union-find clustering finished");

        Ok(Clustering::from_groups(groups.into_values().collect()))
    }
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<usize>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        UnionFind {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            // Path halving
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, i: usize, j: usize) {
        let root_i = self.find(i);
        let root_j = self.find(j);
        if root_i == root_j {
            return;
        }
        if self.rank[root_i] < self.rank[root_j] {
            self.parent[root_i] = root_j;
        } else if self.rank[root_i] > self.rank[root_j] {
            self.parent[root_j] = root_i;
        } else {
            self.parent[root_j] = root_i;
            self.rank[root_i] += 1;
        }
    }
}

impl FrontierSource for ColumnarSession {
    fn lookup(&self, key: &NodeKey) -> GraphResult<Option<NodeId>> {
        let tables = self.store.snapshot();
        let id = key.node_id();
        Ok(tables
            .node_index(id)
            .filter(|idx| tables.node_kinds[*idx] == key.kind && tables.node_keys[*idx] == key.key)
            .map(|_| id))
    }

    fn resolve(&self, ids: &[NodeId]) -> GraphResult<HashMap<NodeId, NodeKey>> {
        let tables = self.store.snapshot();
        Ok(ids
            .iter()
            .filter_map(|id| tables.node_index(*id).map(|idx| (*id, tables.node_key(idx))))
            .collect())
    }

    fn all_nodes(&self) -> GraphResult<Vec<NodeId>> {
        Ok(self.store.snapshot().node_ids.clone())
    }

    fn expand(&self, frontier: &[NodeId], scope: &LinkScope) -> GraphResult<Vec<Link>> {
        let tables = self.store.snapshot();
        let keep = |row: usize| scope.relation.map_or(true, |r| r == tables.edge_relation[row]);
        let mut links = Vec::new();

        if scope.direction != Direction::Incoming {
            for &id in frontier {
                let mut by_target: BTreeMap<NodeId, u64> = BTreeMap::new();
                for row in tables.outgoing_rows(id).filter(|row| keep(*row)) {
                    *by_target.entry(tables.edge_target[row]).or_insert(0) += tables.edge_weight[row];
                }
                links.extend(
                    by_target
                        .into_iter()
                        .filter(|(_, w)| *w >= scope.min_weight)
                        .map(|(to, weight)| Link { from: id, to, weight }),
                );
            }
        }

        if scope.direction != Direction::Outgoing {
            let inbound = self.inbound(&tables);
            for &id in frontier {
                let start = inbound.partition_point(|row| tables.edge_target[*row] < id);
                let end = inbound.partition_point(|row| tables.edge_target[*row] <= id);

                let mut by_source: BTreeMap<NodeId, u64> = BTreeMap::new();
                for &row in inbound[start..end].iter().filter(|row| keep(**row)) {
                    *by_source.entry(tables.edge_source[row]).or_insert(0) += tables.edge_weight[row];
                }
                links.extend(
                    by_source
                        .into_iter()
                        .filter(|(_, w)| *w >= scope.min_weight)
                        .map(|(to, weight)| Link { from: id, to, weight }),
                );
            }
        }

        Ok(links)
    }
}

impl GraphBackend for ColumnarSession {
    fn name(&self) -> &str {
        COLUMNAR_BACKEND
    }

    fn support(&self, class: QueryClass) -> Support {
        match class {
            QueryClass::Clustering => Support::Native,
            QueryClass::ReferralChain | QueryClass::RingDetection | QueryClass::ShortestPath => {
                Support::Emulated
            }
        }
    }

    fn health_check(&self) -> GraphResult<()> {
        // In-process store, no connection to lose
        Ok(())
    }

    fn replace_graph(&self, tables: &GraphTables, deadline: &Deadline) -> GraphResult<()> {
        let columns = ColumnarTables::from_graph(tables);
        if deadline.expired() {
            return Err(GraphError::BuildTimeout {
                limit_ms: deadline.limit_ms(),
            });
        }
        self.store.swap(columns);
        self.drop_caches()
    }

    fn graph_counts(&self) -> GraphResult<(u64, u64)> {
        let tables = self.store.snapshot();
        Ok((tables.node_ids.len() as u64, tables.edge_source.len() as u64))
    }

    fn drop_caches(&self) -> GraphResult<()> {
        match self.inbound.lock() {
            Ok(mut cache) => *cache = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        Ok(())
    }

    fn referral_chain(&self, params: &ChainParams, ctx: &mut QueryContext) -> GraphResult<Vec<ChainHit>> {
        frontier::chain_walk(self, params, ctx)
    }

    fn detect_rings(&self, params: &RingParams, ctx: &mut QueryContext) -> GraphResult<Vec<Ring>> {
        frontier::find_rings(self, params, ctx)
    }

    fn shortest_path(&self, params: &PathParams, ctx: &mut QueryContext) -> GraphResult<PathOutcome> {
        frontier::shortest_path(self, params, ctx)
    }

    fn cluster(&self, params: &ClusterParams, ctx: &mut QueryContext) -> GraphResult<Clustering> {
        self.union_find_components(params, ctx)
    }
}

// ============================================================================
// FACTORY
// ============================================================================

pub struct ColumnarFactory {
    store: Arc<ColumnarStore>,
    gate: Arc<RebuildGate>,
    options: AdapterOptions,
}

impl ColumnarFactory {
    pub fn new(store: Arc<ColumnarStore>, gate: Arc<RebuildGate>, options: AdapterOptions) -> Self {
        ColumnarFactory { store, gate, options }
    }
}

impl BackendFactory for ColumnarFactory {
    fn name(&self) -> &str {
        COLUMNAR_BACKEND
    }

    fn connect(&self) -> GraphResult<BackendAdapter> {
        let session = ColumnarSession::new(Arc::clone(&self.store));
        session.health_check()?;
        Ok(BackendAdapter::new(
            Box::new(session),
            Arc::clone(&self.gate),
            self.options,
        ))
    }
}
