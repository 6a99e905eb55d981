// 🌊 Frontier Engine - Level-by-level traversal over frontier joins
//
// Each depth level materializes its frontier and asks the backend for one
// join against the edge table. The engine never sees the edge table itself,
// only the `FrontierSource` seam, so any backend without recursive queries
// still answers all four traversal classes.

use super::{
    better_path, hop_cost, normalize_ring, sort_rings, ChainHit, ChainParams, ClusterParams,
    Clustering, Direction, GraphPath, PathOutcome, PathParams, QueryContext, Ring, RingParams,
    Termination, TraversalPath,
};
use crate::entities::{NodeId, NodeKey, RelationType};
use crate::error::{GraphError, GraphResult};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

// ============================================================================
// FRONTIER SOURCE (backend seam)
// ============================================================================

/// Which links a frontier join returns
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkScope {
    /// None = all relations, weights summed across them
    pub relation: Option<RelationType>,
    pub direction: Direction,
    /// Links with aggregated weight below this are dropped
    pub min_weight: u64,
}

impl LinkScope {
    pub fn new(relation: Option<RelationType>, direction: Direction) -> Self {
        LinkScope {
            relation,
            direction,
            min_weight: 0,
        }
    }
}

/// One traversable hop, oriented away from the frontier node `from`.
/// `weight` is the edge weight summed over every bucket of the directed pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub from: NodeId,
    pub to: NodeId,
    pub weight: u64,
}

pub trait FrontierSource {
    fn lookup(&self, key: &NodeKey) -> GraphResult<Option<NodeId>>;

    fn resolve(&self, ids: &[NodeId]) -> GraphResult<HashMap<NodeId, NodeKey>>;

    fn all_nodes(&self) -> GraphResult<Vec<NodeId>>;

    /// One frontier join: every link leaving a frontier node in the scope's direction.
    /// With `Direction::Both` a pair linked both ways yields one link per direction.
    fn expand(&self, frontier: &[NodeId], scope: &LinkScope) -> GraphResult<Vec<Link>>;
}

pub fn require_node<S: FrontierSource + ?Sized>(source: &S, key: &NodeKey) -> GraphResult<NodeId> {
    source
        .lookup(key)?
        .ok_or_else(|| GraphError::NodeNotFound(key.clone()))
}

// ============================================================================
// KEY CACHE
// ============================================================================

/// Ids resolved to keys so far; every tie-break compares keys, not ids
pub struct KeyCache {
    keys: HashMap<NodeId, NodeKey>,
}

impl KeyCache {
    pub fn new() -> Self {
        KeyCache {
            keys: HashMap::new(),
        }
    }

    /// Resolve every id not seen yet, in one call
    pub fn fill<S, I>(&mut self, source: &S, ids: I) -> GraphResult<()>
    where
        S: FrontierSource + ?Sized,
        I: IntoIterator<Item = NodeId>,
    {
        let mut missing: Vec<NodeId> = ids
            .into_iter()
            .filter(|id| !self.keys.contains_key(id))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort_unstable();
        missing.dedup();

        let resolved = source.resolve(&missing)?;
        for id in missing {
            let key = resolved.get(&id).cloned().ok_or_else(|| {
                GraphError::InvalidParameter(format!("edge endpoint {} has no node row", id))
            })?;
            self.keys.insert(id, key);
        }
        Ok(())
    }

    pub fn key(&self, id: NodeId) -> GraphResult<&NodeKey> {
        self.keys
            .get(&id)
            .ok_or_else(|| GraphError::InvalidParameter(format!("unresolved node id {}", id)))
    }

    pub fn path(&self, ids: &[NodeId]) -> GraphResult<Vec<NodeKey>> {
        ids.iter().map(|id| self.key(*id).cloned()).collect()
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        KeyCache::new()
    }
}

fn join<S: FrontierSource + ?Sized>(
    source: &S,
    frontier: &[NodeId],
    scope: &LinkScope,
    ctx: &mut QueryContext,
) -> GraphResult<Vec<Link>> {
    ctx.check()?;
    let links = source.expand(frontier, scope)?;
    ctx.frontier_joins += 1;
    ctx.rows_examined += links.len() as u64;
    Ok(links)
}

// ============================================================================
// REFERRAL CHAIN
// ============================================================================

pub fn chain_walk<S: FrontierSource + ?Sized>(
    source: &S,
    params: &ChainParams,
    ctx: &mut QueryContext,
) -> GraphResult<Vec<ChainHit>> {
    let start = require_node(source, &params.start)?;
    let scope = LinkScope::new(params.relation, params.direction);

    let mut keys = KeyCache::new();
    keys.fill(source, [start])?;

    // Best path per reached node; doubles as the visited set
    let mut best: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    best.insert(start, vec![start]);

    let mut frontier = vec![start];
    let mut hits = Vec::new();

    for depth in 1..=params.max_depth {
        if frontier.is_empty() {
            break;
        }
        let links = join(source, &frontier, &scope, ctx)?;
        keys.fill(source, links.iter().map(|l| l.to))?;

        let mut level: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for link in &links {
            if best.contains_key(&link.to) {
                ctx.stops.record(Termination::Cycle);
                continue;
            }
            let Some(parent) = best.get(&link.from) else {
                continue;
            };
            let mut candidate = parent.clone();
            candidate.push(link.to);

            let replace = match level.get(&link.to) {
                None => true,
                Some(current) => keys.path(&candidate)? < keys.path(current)?,
            };
            if replace {
                level.insert(link.to, candidate);
            }
        }

        debug!(depth, frontier = frontier.len(), reached = level.len(), "Chain level expanded");

        if depth == params.max_depth {
            ctx.stops.add(Termination::DepthLimit, level.len() as u64);
        }

        frontier = level.keys().copied().collect();
        frontier.sort_unstable();
        for (node, path) in level {
            hits.push(ChainHit {
                node: keys.key(node)?.clone(),
                depth,
                path: keys.path(&path)?,
            });
            best.insert(node, path);
        }
    }

    ctx.check()?;
    hits.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.node.cmp(&b.node)));
    Ok(hits)
}

// ============================================================================
// RING DETECTION
// ============================================================================

pub fn find_rings<S: FrontierSource + ?Sized>(
    source: &S,
    params: &RingParams,
    ctx: &mut QueryContext,
) -> GraphResult<Vec<Ring>> {
    let scope = LinkScope::new(params.relation, Direction::Outgoing);

    // Without a start node each ring is enumerated once, from its smallest node
    let (starts, smallest_first) = match &params.start {
        Some(key) => (vec![require_node(source, key)?], false),
        None => (source.all_nodes()?, true),
    };

    let mut keys = KeyCache::new();
    keys.fill(source, starts.iter().copied())?;

    let mut paths: Vec<TraversalPath> = starts.into_iter().map(TraversalPath::start).collect();
    let mut found: BTreeMap<Vec<NodeKey>, Ring> = BTreeMap::new();

    for depth in 0..params.max_depth {
        if paths.is_empty() {
            break;
        }
        let tails: BTreeSet<NodeId> = paths.iter().map(|p| p.tail()).collect();
        let tails: Vec<NodeId> = tails.into_iter().collect();
        let links = join(source, &tails, &scope, ctx)?;
        keys.fill(source, links.iter().map(|l| l.to))?;

        let mut adjacency: HashMap<NodeId, Vec<(NodeId, u64)>> = HashMap::new();
        for link in &links {
            adjacency.entry(link.from).or_default().push((link.to, link.weight));
        }

        let mut next = Vec::new();
        for path in &paths {
            let Some(neighbors) = adjacency.get(&path.tail()) else {
                continue;
            };
            for &(to, weight) in neighbors {
                if to == path.origin() {
                    if path.depth() + 1 >= 2 {
                        let mut closed = path.extend(to, weight);
                        closed.terminate(Termination::TargetReached, &mut ctx.stops);
                        // The closing hop repeats the origin
                        closed.nodes.pop();
                        let ring = normalize_ring(keys.path(&closed.nodes)?, closed.weights, params.weight);
                        found.entry(ring.nodes.clone()).or_insert(ring);
                    }
                    continue;
                }
                if path.contains(to) {
                    ctx.stops.record(Termination::Cycle);
                    continue;
                }
                if smallest_first && keys.key(to)? <= keys.key(path.origin())? {
                    continue;
                }
                if depth + 2 <= params.max_depth {
                    next.push(path.extend(to, weight));
                } else {
                    ctx.stops.record(Termination::DepthLimit);
                }
            }
        }

        debug!(depth = depth + 1, open_paths = next.len(), rings = found.len(), "Ring level expanded");
        paths = next;
    }

    ctx.check()?;
    let mut rings: Vec<Ring> = found.into_values().collect();
    sort_rings(&mut rings);
    Ok(rings)
}

// ============================================================================
// SHORTEST PATH
// ============================================================================

/// Level-synchronous relaxation: level `k` relaxes the links of nodes whose
/// label improved at level `k - 1`, using the labels as they stood before `k`.
pub fn shortest_path<S: FrontierSource + ?Sized>(
    source: &S,
    params: &PathParams,
    ctx: &mut QueryContext,
) -> GraphResult<PathOutcome> {
    let from = require_node(source, &params.from)?;
    let to = require_node(source, &params.to)?;

    if from == to {
        ctx.check()?;
        return Ok(PathOutcome::Found(GraphPath {
            nodes: vec![params.from.clone()],
            cost: 0.0,
            hops: 0,
        }));
    }

    let scope = LinkScope::new(params.relation, params.direction);
    let mut keys = KeyCache::new();
    keys.fill(source, [from, to])?;

    let mut labels: HashMap<NodeId, TraversalPath> = HashMap::new();
    labels.insert(from, TraversalPath::start(from));
    let mut frontier = vec![from];

    for hop in 1..=params.max_hops {
        if frontier.is_empty() {
            break;
        }
        let snapshot: HashMap<NodeId, TraversalPath> = frontier
            .iter()
            .filter_map(|id| labels.get(id).map(|p| (*id, p.clone())))
            .collect();

        let links = join(source, &frontier, &scope, ctx)?;
        keys.fill(source, links.iter().map(|l| l.to))?;

        let mut improved: BTreeSet<NodeId> = BTreeSet::new();
        for link in &links {
            let Some(parent) = snapshot.get(&link.from) else {
                continue;
            };
            if parent.contains(link.to) {
                ctx.stops.record(Termination::Cycle);
                continue;
            }
            let mut candidate = parent.extend(link.to, link.weight);
            if link.to == to {
                candidate.terminate(Termination::TargetReached, &mut ctx.stops);
            }

            let replace = match labels.get(&link.to) {
                None => true,
                Some(current) => {
                    let candidate_keys = keys.path(&candidate.nodes)?;
                    let current_keys = keys.path(&current.nodes)?;
                    better_path(
                        (candidate.cost, &candidate_keys),
                        (current.cost, &current_keys),
                    )
                }
            };
            if replace {
                labels.insert(link.to, candidate);
                improved.insert(link.to);
            }
        }

        debug!(hop, frontier = frontier.len(), improved = improved.len(), "Path level relaxed");

        // Paths are never extended through the target
        improved.retain(|id| labels.get(id).map_or(false, |p| p.is_open()));
        frontier = improved.into_iter().collect();
    }

    // Labels still improving when the hop budget ran out
    ctx.stops.add(Termination::DepthLimit, frontier.len() as u64);
    ctx.check()?;
    match labels.get(&to) {
        Some(path) => Ok(PathOutcome::Found(GraphPath {
            nodes: keys.path(&path.nodes)?,
            cost: path_cost(&path.weights),
            hops: path.depth(),
        })),
        None => Ok(PathOutcome::NoPath),
    }
}

// ============================================================================
// CLUSTERING
// ============================================================================

/// Min-label propagation: each round joins the nodes whose label dropped
/// in the previous round, until no label changes.
pub fn components<S: FrontierSource + ?Sized>(
    source: &S,
    params: &ClusterParams,
    ctx: &mut QueryContext,
) -> GraphResult<Clustering> {
    let mut nodes = source.all_nodes()?;
    nodes.sort_unstable();

    let scope = LinkScope {
        relation: params.relation,
        direction: Direction::Both,
        min_weight: params.weight_threshold,
    };

    let mut labels: HashMap<NodeId, NodeId> = nodes.iter().map(|id| (*id, *id)).collect();
    let mut frontier = nodes.clone();
    let mut round = 0usize;

    while !frontier.is_empty() {
        round += 1;
        let links = join(source, &frontier, &scope, ctx)?;

        let mut changed: BTreeSet<NodeId> = BTreeSet::new();
        for link in &links {
            let (Some(&from_label), Some(&to_label)) = (labels.get(&link.from), labels.get(&link.to))
            else {
                continue;
            };
            if from_label < to_label {
                labels.insert(link.to, from_label);
                changed.insert(link.to);
            }
        }

        debug!(round, frontier = frontier.len(), changed = changed.len(), "Label propagation round");
        frontier = changed.into_iter().collect();
    }

    ctx.check()?;

    let mut keys = KeyCache::new();
    keys.fill(source, nodes.iter().copied())?;

    let mut groups: HashMap<NodeId, Vec<NodeKey>> = HashMap::new();
    let mut seen: HashSet<NodeId> = HashSet::new();
    for id in &nodes {
        if !seen.insert(*id) {
            continue;
        }
        let label = labels.get(id).copied().unwrap_or(*id);
        groups.entry(label).or_default().push(keys.key(*id)?.clone());
    }

    Ok(Clustering::from_groups(groups.into_values().collect()))
}

/// Cost of a full hop-weight sequence, summed first hop first
pub fn path_cost(weights: &[u64]) -> f64 {
    weights.iter().fold(0.0, |cost, w| cost + hop_cost(*w))
}
