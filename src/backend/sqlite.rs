// 🪨 SQLite backend - Row store with native recursive traversal
//
// Chain, ring and shortest-path queries each run as one recursive CTE.
// A comma-delimited path string carries the visited set: a hop is taken
// only if `instr(path, ',id,') = 0`. Clustering has no recursive form
// here and is emulated with frontier joins against a temp table.

use super::{AdapterOptions, BackendAdapter, BackendFactory, GraphBackend, RebuildGate, Support};
use crate::builder::GraphTables;
use crate::db;
use crate::entities::{NodeId, NodeKey};
use crate::error::{GraphError, GraphResult};
use crate::traversal::frontier::{self, require_node, FrontierSource, KeyCache, Link, LinkScope};
use crate::traversal::{
    cmp_cost, normalize_ring, sort_rings, ChainHit, ChainParams, ClusterParams, Clustering,
    Deadline, GraphPath, PathOutcome, PathParams, QueryClass, QueryContext, Ring, RingParams,
    Termination,
};
use rusqlite::{params, Connection, ErrorCode, Params, Row};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub const SQLITE_BACKEND: &str = "sqlite";

/// Virtual machine instructions between deadline checks
const PROGRESS_OPS: i32 = 1_000;

// ============================================================================
// RECURSIVE TRAVERSAL TEMPLATES
// ============================================================================
//
// Every walk row carries a `stop` code: 0 open, 1 refused by the cycle guard,
// 2 reached the target (rings: closed back at the origin). Only open rows
// recurse; stopped rows are kept so the branch stops can be counted.

const STOP_OPEN: i64 = 0;
const STOP_CYCLE: i64 = 1;
const STOP_TARGET: i64 = 2;

/// ?1 start, ?2 relation (nullable), ?3 direction code, ?4 max depth
const CHAIN_SQL: &str = "
WITH RECURSIVE
    links(src, dst) AS MATERIALIZED (
        SELECT source_id, target_id FROM graph_edges
        WHERE ?2 IS NULL OR edge_type = ?2
        GROUP BY source_id, target_id
    ),
    hops(from_id, to_id) AS MATERIALIZED (
        SELECT src, dst FROM links WHERE ?3 IN (0, 2)
        UNION
        SELECT dst, src FROM links WHERE ?3 IN (1, 2)
    ),
    walk(node_id, depth, path, stop) AS (
        SELECT ?1, 0, ',' || ?1 || ',', 0
        UNION ALL
        SELECT h.to_id, w.depth + 1, w.path || h.to_id || ',',
               instr(w.path, ',' || h.to_id || ',') > 0
        FROM walk w
        JOIN hops h ON h.from_id = w.node_id
        WHERE w.depth < ?4
          AND w.stop = 0
    )
SELECT stop, node_id, depth, path FROM walk WHERE depth > 0";

/// ?1 relation (nullable), ?2 start (nullable), ?3 max length, ?4 smallest-origin pruning flag
const RING_SQL: &str = "
WITH RECURSIVE
    links(src, dst, w) AS MATERIALIZED (
        SELECT source_id, target_id, SUM(weight) FROM graph_edges
        WHERE ?1 IS NULL OR edge_type = ?1
        GROUP BY source_id, target_id
    ),
    walk(origin, origin_type, origin_key, node_id, depth, path, weights, stop) AS (
        SELECT node_id, entity_type, natural_key, node_id, 0, ',' || node_id || ',', ',', 0
        FROM graph_nodes
        WHERE ?2 IS NULL OR node_id = ?2
        UNION ALL
        SELECT w.origin, w.origin_type, w.origin_key, l.dst, w.depth + 1,
               w.path || l.dst || ',', w.weights || l.w || ',',
               CASE
                   WHEN l.dst = w.origin THEN 2
                   WHEN instr(w.path, ',' || l.dst || ',') > 0 THEN 1
                   ELSE 0
               END
        FROM walk w
        JOIN links l ON l.src = w.node_id
        JOIN graph_nodes t ON t.node_id = l.dst
        WHERE w.depth < ?3
          AND w.stop = 0
          AND (
                l.dst = w.origin
                OR ?4 = 0
                OR (t.entity_type, t.natural_key) > (w.origin_type, w.origin_key)
          )
    )
SELECT stop, depth,
       CASE WHEN stop = 2 THEN path END,
       CASE WHEN stop = 2 THEN weights END
FROM walk
WHERE (stop = 2 AND depth >= 2) OR stop = 1 OR (stop = 0 AND depth = ?3)";

/// ?1 from, ?2 relation (nullable), ?3 direction code, ?4 max hops, ?5 target
const PATH_SQL: &str = "
WITH RECURSIVE
    links(src, dst, w) AS MATERIALIZED (
        SELECT source_id, target_id, SUM(weight) FROM graph_edges
        WHERE ?2 IS NULL OR edge_type = ?2
        GROUP BY source_id, target_id
    ),
    hops(from_id, to_id, w) AS MATERIALIZED (
        SELECT src, dst, w FROM links WHERE ?3 IN (0, 2)
        UNION ALL
        SELECT dst, src, w FROM links WHERE ?3 IN (1, 2)
    ),
    walk(node_id, depth, weights, path, stop) AS (
        SELECT ?1, 0, ',', ',' || ?1 || ',', 0
        UNION ALL
        SELECT h.to_id, w.depth + 1, w.weights || h.w || ',', w.path || h.to_id || ',',
               CASE
                   WHEN instr(w.path, ',' || h.to_id || ',') > 0 THEN 1
                   WHEN h.to_id = ?5 THEN 2
                   ELSE 0
               END
        FROM walk w
        JOIN hops h ON h.from_id = w.node_id
        WHERE w.depth < ?4
          AND w.stop = 0
    )
SELECT stop, depth,
       CASE WHEN stop = 2 THEN weights END,
       CASE WHEN stop = 2 THEN path END
FROM walk
WHERE stop > 0 OR (stop = 0 AND depth = ?4)";

/// One frontier join: ?1 relation (nullable), ?2 direction code, ?3 min weight
const EXPAND_SQL: &str = "
SELECT e.source_id, e.target_id, SUM(e.weight) AS w
FROM graph_edges e
JOIN temp.frontier f ON f.node_id = e.source_id
WHERE ?2 IN (0, 2) AND (?1 IS NULL OR e.edge_type = ?1)
GROUP BY e.source_id, e.target_id
HAVING SUM(e.weight) >= ?3
UNION ALL
SELECT e.target_id, e.source_id, SUM(e.weight) AS w
FROM graph_edges e
JOIN temp.frontier f ON f.node_id = e.target_id
WHERE ?2 IN (1, 2) AND (?1 IS NULL OR e.edge_type = ?1)
GROUP BY e.target_id, e.source_id
HAVING SUM(e.weight) >= ?3";

// ============================================================================
// CONNECTION HANDLING
// ============================================================================

fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("SQLite connection mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Interrupts the running statement once the deadline passes; removed on drop
struct InterruptGuard<'a> {
    conn: &'a Connection,
}

impl<'a> InterruptGuard<'a> {
    fn install(conn: &'a Connection, deadline: Deadline) -> Self {
        conn.progress_handler(PROGRESS_OPS, Some(move || deadline.expired()));
        InterruptGuard { conn }
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
    }
}

fn interrupted_as_timeout(err: rusqlite::Error, ctx: &QueryContext) -> GraphError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::OperationInterrupted => {
            ctx.timeout()
        }
        _ => err.into(),
    }
}

fn collect_rows<T, P, F>(conn: &Connection, sql: &str, params: P, map: F) -> rusqlite::Result<Vec<T>>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare_cached(sql)?;
    let rows: rusqlite::Result<Vec<T>> = stmt.query_map(params, map)?.collect();
    rows
}

/// `,12,34,` → [12, 34]
fn parse_id_list(path: &str) -> GraphResult<Vec<NodeId>> {
    path.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<NodeId>()
                .map_err(|_| GraphError::InvalidParameter(format!("bad path element {:?}", part)))
        })
        .collect()
}

fn parse_weight_list(weights: &str) -> GraphResult<Vec<u64>> {
    weights
        .split(',')
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| GraphError::InvalidParameter(format!("bad weight element {:?}", part)))
        })
        .collect()
}

// ============================================================================
// BACKEND
// ============================================================================

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn new(conn: Connection) -> GraphResult<Self> {
        db::setup_database(&conn)?;
        Ok(SqliteBackend {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: &Path) -> GraphResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        SqliteBackend::new(conn)
    }

    pub fn in_memory() -> GraphResult<Self> {
        SqliteBackend::new(Connection::open_in_memory()?)
    }

    /// Run one native traversal statement under the query deadline
    fn query_rows<T, P, F>(&self, sql: &str, params: P, ctx: &mut QueryContext, map: F) -> GraphResult<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        ctx.check()?;
        let conn = acquire_lock(&self.conn);
        let _interrupt = InterruptGuard::install(&conn, ctx.deadline);

        let rows = collect_rows(&conn, sql, params, map).map_err(|e| interrupted_as_timeout(e, ctx))?;
        ctx.rows_examined += rows.len() as u64;
        ctx.check()?;
        Ok(rows)
    }

    fn native_chain(&self, params: &ChainParams, ctx: &mut QueryContext) -> GraphResult<Vec<ChainHit>> {
        let start = require_node(self, &params.start)?;
        let relation = params.relation.map(|r| r.as_str());

        let rows = self.query_rows(
            CHAIN_SQL,
            params![start, relation, params.direction.code(), params.max_depth as i64],
            ctx,
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, NodeId>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )?;

        // Minimal depth per node, with every path reaching it at that depth
        let mut reached: HashMap<NodeId, (usize, Vec<Vec<NodeId>>)> = HashMap::new();
        for (stop, node, depth, path) in rows {
            let depth = depth as usize;
            if stop == STOP_CYCLE {
                ctx.stops.record(Termination::Cycle);
                continue;
            }
            if depth == params.max_depth {
                ctx.stops.record(Termination::DepthLimit);
            }
            let entry = reached.entry(node).or_insert((depth, Vec::new()));
            if depth < entry.0 {
                *entry = (depth, Vec::new());
            }
            if depth == entry.0 {
                entry.1.push(parse_id_list(&path)?);
            }
        }

        let mut keys = KeyCache::new();
        keys.fill(self, reached.values().flat_map(|(_, paths)| paths.iter().flatten().copied()))?;

        let mut hits = Vec::with_capacity(reached.len());
        for (node, (depth, paths)) in reached {
            let mut best: Option<Vec<NodeKey>> = None;
            for path in &paths {
                let candidate = keys.path(path)?;
                if best.as_ref().map_or(true, |b| candidate < *b) {
                    best = Some(candidate);
                }
            }
            hits.push(ChainHit {
                node: keys.key(node)?.clone(),
                depth,
                path: best.unwrap_or_default(),
            });
        }

        hits.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.node.cmp(&b.node)));
        Ok(hits)
    }

    fn native_rings(&self, params: &RingParams, ctx: &mut QueryContext) -> GraphResult<Vec<Ring>> {
        let start = match &params.start {
            Some(key) => Some(require_node(self, key)?),
            None => None,
        };
        let relation = params.relation.map(|r| r.as_str());
        let prune = i64::from(start.is_none());

        let rows = self.query_rows(
            RING_SQL,
            params![relation, start, params.max_depth as i64, prune],
            ctx,
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;

        let mut cycles = Vec::new();
        for (stop, path, weights) in rows {
            let (Some(path), Some(weights)) = (path, weights) else {
                let reason = if stop == STOP_CYCLE { Termination::Cycle } else { Termination::DepthLimit };
                ctx.stops.record(reason);
                continue;
            };
            ctx.stops.record(Termination::TargetReached);
            let mut nodes = parse_id_list(&path)?;
            // The closing hop repeats the origin
            nodes.pop();
            cycles.push((nodes, parse_weight_list(&weights)?));
        }

        let mut keys = KeyCache::new();
        keys.fill(self, cycles.iter().flat_map(|(nodes, _)| nodes.iter().copied()))?;

        let mut found: BTreeMap<Vec<NodeKey>, Ring> = BTreeMap::new();
        for (nodes, weights) in cycles {
            let ring = normalize_ring(keys.path(&nodes)?, weights, params.weight);
            found.entry(ring.nodes.clone()).or_insert(ring);
        }

        let mut rings: Vec<Ring> = found.into_values().collect();
        sort_rings(&mut rings);
        Ok(rings)
    }

    fn native_path(&self, params: &PathParams, ctx: &mut QueryContext) -> GraphResult<PathOutcome> {
        let from = require_node(self, &params.from)?;
        let to = require_node(self, &params.to)?;
        if from == to {
            return Ok(PathOutcome::Found(GraphPath {
                nodes: vec![params.from.clone()],
                cost: 0.0,
                hops: 0,
            }));
        }
        let relation = params.relation.map(|r| r.as_str());

        let rows = self.query_rows(
            PATH_SQL,
            params![from, relation, params.direction.code(), params.max_hops as i64, to],
            ctx,
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;

        // Costs are summed here, in hop order, the same way the frontier engine sums them
        let mut candidates: Vec<(usize, f64, &str)> = Vec::new();
        for (stop, depth, weights, path) in &rows {
            match (*stop, weights, path) {
                (STOP_TARGET, Some(weights), Some(path)) => {
                    ctx.stops.record(Termination::TargetReached);
                    let cost = frontier::path_cost(&parse_weight_list(weights)?);
                    candidates.push((*depth as usize, cost, path.as_str()));
                }
                (STOP_CYCLE, _, _) => ctx.stops.record(Termination::Cycle),
                (STOP_OPEN, _, _) => ctx.stops.record(Termination::DepthLimit),
                _ => {}
            }
        }

        // Cheapest, then fewest hops; key paths only break ties
        let Some(&(best_hops, best_cost, _)) = candidates
            .iter()
            .min_by(|a, b| cmp_cost(a.1, b.1).then_with(|| a.0.cmp(&b.0)))
        else {
            return Ok(PathOutcome::NoPath);
        };
        let tied: Vec<Vec<NodeId>> = candidates
            .iter()
            .filter(|(hops, cost, _)| *hops == best_hops && cmp_cost(*cost, best_cost).is_eq())
            .map(|(_, _, path)| parse_id_list(path))
            .collect::<GraphResult<_>>()?;

        let mut keys = KeyCache::new();
        keys.fill(self, tied.iter().flatten().copied())?;
        let mut best: Option<Vec<NodeKey>> = None;
        for path in &tied {
            let candidate = keys.path(path)?;
            if best.as_ref().map_or(true, |b| candidate < *b) {
                best = Some(candidate);
            }
        }

        debug!(candidates = candidates.len(), tied = tied.len(), "Shortest path candidates enumerated");
        Ok(PathOutcome::Found(GraphPath {
            nodes: best.unwrap_or_default(),
            cost: best_cost,
            hops: best_hops,
        }))
    }
}

impl FrontierSource for SqliteBackend {
    fn lookup(&self, key: &NodeKey) -> GraphResult<Option<NodeId>> {
        db::lookup_node(&acquire_lock(&self.conn), key)
    }

    fn resolve(&self, ids: &[NodeId]) -> GraphResult<HashMap<NodeId, NodeKey>> {
        db::resolve_nodes(&acquire_lock(&self.conn), ids)
    }

    fn all_nodes(&self) -> GraphResult<Vec<NodeId>> {
        db::all_node_ids(&acquire_lock(&self.conn))
    }

    fn expand(&self, frontier: &[NodeId], scope: &LinkScope) -> GraphResult<Vec<Link>> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn.transaction()?;

        tx.execute("CREATE TEMP TABLE IF NOT EXISTS frontier (node_id INTEGER PRIMARY KEY)", [])?;
        tx.execute("DELETE FROM temp.frontier", [])?;
        {
            let mut insert = tx.prepare_cached("INSERT OR IGNORE INTO temp.frontier (node_id) VALUES (?1)")?;
            for id in frontier {
                insert.execute(params![id])?;
            }
        }

        let relation = scope.relation.map(|r| r.as_str());
        let links = collect_rows(
            &tx,
            EXPAND_SQL,
            params![relation, scope.direction.code(), scope.min_weight as i64],
            |row| {
                Ok(Link {
                    from: row.get(0)?,
                    to: row.get(1)?,
                    weight: row.get::<_, i64>(2)? as u64,
                })
            },
        )?;
        tx.commit()?;

        Ok(links)
    }
}

impl GraphBackend for SqliteBackend {
    fn name(&self) -> &str {
        SQLITE_BACKEND
    }

    fn support(&self, class: QueryClass) -> Support {
        match class {
            QueryClass::ReferralChain | QueryClass::RingDetection | QueryClass::ShortestPath => {
                Support::Native
            }
            QueryClass::Clustering => Support::Emulated,
        }
    }

    fn health_check(&self) -> GraphResult<()> {
        let conn = acquire_lock(&self.conn);
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|e| GraphError::unavailable(SQLITE_BACKEND, e))
    }

    fn replace_graph(&self, tables: &GraphTables, deadline: &Deadline) -> GraphResult<()> {
        let mut conn = acquire_lock(&self.conn);
        db::write_graph(&mut conn, tables, deadline)?;
        conn.flush_prepared_statement_cache();
        Ok(())
    }

    fn graph_counts(&self) -> GraphResult<(u64, u64)> {
        db::graph_counts(&acquire_lock(&self.conn))
    }

    fn drop_caches(&self) -> GraphResult<()> {
        let conn = acquire_lock(&self.conn);
        conn.flush_prepared_statement_cache();
        conn.execute_batch("PRAGMA shrink_memory")?;
        Ok(())
    }

    fn storage_bytes(&self) -> GraphResult<Option<u64>> {
        let conn = acquire_lock(&self.conn);
        // In-memory databases report an empty file name
        if conn.path().map_or(true, str::is_empty) {
            return Ok(None);
        }
        let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(Some((pages * page_size) as u64))
    }

    #[instrument(skip(self, ctx), fields(start = %params.start))]
    fn referral_chain(&self, params: &ChainParams, ctx: &mut QueryContext) -> GraphResult<Vec<ChainHit>> {
        self.native_chain(params, ctx)
    }

    #[instrument(skip(self, ctx))]
    fn detect_rings(&self, params: &RingParams, ctx: &mut QueryContext) -> GraphResult<Vec<Ring>> {
        self.native_rings(params, ctx)
    }

    #[instrument(skip(self, ctx), fields(from = %params.from, to = %params.to))]
    fn shortest_path(&self, params: &PathParams, ctx: &mut QueryContext) -> GraphResult<PathOutcome> {
        self.native_path(params, ctx)
    }

    fn cluster(&self, params: &ClusterParams, ctx: &mut QueryContext) -> GraphResult<Clustering> {
        frontier::components(self, params, ctx)
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Opens a fresh connection to one database file per run
pub struct SqliteFactory {
    path: PathBuf,
    gate: Arc<RebuildGate>,
    options: AdapterOptions,
}

impl SqliteFactory {
    pub fn new(path: impl Into<PathBuf>, gate: Arc<RebuildGate>, options: AdapterOptions) -> Self {
        SqliteFactory {
            path: path.into(),
            gate,
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackendFactory for SqliteFactory {
    fn name(&self) -> &str {
        SQLITE_BACKEND
    }

    fn connect(&self) -> GraphResult<BackendAdapter> {
        let backend = SqliteBackend::open(&self.path).map_err(|e| GraphError::unavailable(SQLITE_BACKEND, e))?;
        backend.health_check()?;
        Ok(BackendAdapter::new(
            Box::new(backend),
            Arc::clone(&self.gate),
            self.options,
        ))
    }
}
