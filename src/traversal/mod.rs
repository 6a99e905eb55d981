// 🧭 Traversal Engine - The four query classes over node/edge tables
//
// Query parameters, result shapes, deadlines and ring normalization live
// here. `frontier` holds the level-by-level engine used wherever a backend
// has no native recursion for a class.

pub mod frontier;

use crate::entities::{NodeId, NodeKey, RelationType};
use crate::error::{GraphError, GraphResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

pub use frontier::{FrontierSource, Link, LinkScope};

// ============================================================================
// QUERY CLASSES & PARAMETERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    ReferralChain,
    RingDetection,
    ShortestPath,
    Clustering,
}

impl QueryClass {
    pub const ALL: [QueryClass; 4] = [
        QueryClass::ReferralChain,
        QueryClass::RingDetection,
        QueryClass::ShortestPath,
        QueryClass::Clustering,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryClass::ReferralChain => "referral_chain",
            QueryClass::RingDetection => "ring_detection",
            QueryClass::ShortestPath => "shortest_path",
            QueryClass::Clustering => "clustering",
        }
    }
}

impl fmt::Display for QueryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

impl Direction {
    /// Numeric code used by the SQL traversal templates
    pub fn code(&self) -> i64 {
        match self {
            Direction::Outgoing => 0,
            Direction::Incoming => 1,
            Direction::Both => 2,
        }
    }
}

/// How a ring's edge weights are combined into one ring weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingWeight {
    #[default]
    Sum,
    Min,
}

impl RingWeight {
    pub fn combine(&self, weights: &[u64]) -> u64 {
        match self {
            RingWeight::Sum => weights.iter().sum(),
            RingWeight::Min => weights.iter().copied().min().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainParams {
    pub start: NodeKey,
    pub max_depth: usize,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub relation: Option<RelationType>,
}

impl ChainParams {
    pub fn new(start: NodeKey, max_depth: usize) -> Self {
        ChainParams {
            start,
            max_depth,
            direction: Direction::Both,
            relation: None,
        }
    }
}

/// Rings always follow edge direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingParams {
    /// None = every ring in the graph
    pub start: Option<NodeKey>,
    pub max_depth: usize,
    #[serde(default)]
    pub relation: Option<RelationType>,
    #[serde(default)]
    pub weight: RingWeight,
}

impl RingParams {
    pub fn new(start: Option<NodeKey>, max_depth: usize) -> Self {
        RingParams {
            start,
            max_depth,
            relation: None,
            weight: RingWeight::Sum,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathParams {
    pub from: NodeKey,
    pub to: NodeKey,
    pub max_hops: usize,
    #[serde(default = "default_path_direction")]
    pub direction: Direction,
    #[serde(default)]
    pub relation: Option<RelationType>,
}

fn default_path_direction() -> Direction {
    Direction::Outgoing
}

impl PathParams {
    pub fn new(from: NodeKey, to: NodeKey, max_hops: usize) -> Self {
        PathParams {
            from,
            to,
            max_hops,
            direction: Direction::Outgoing,
            relation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterParams {
    /// Links with weight >= threshold connect their endpoints
    pub weight_threshold: u64,
    #[serde(default)]
    pub relation: Option<RelationType>,
}

impl ClusterParams {
    pub fn new(weight_threshold: u64) -> Self {
        ClusterParams {
            weight_threshold,
            relation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum TraversalQuery {
    Chain(ChainParams),
    Rings(RingParams),
    Path(PathParams),
    Cluster(ClusterParams),
}

impl TraversalQuery {
    pub fn class(&self) -> QueryClass {
        match self {
            TraversalQuery::Chain(_) => QueryClass::ReferralChain,
            TraversalQuery::Rings(_) => QueryClass::RingDetection,
            TraversalQuery::Path(_) => QueryClass::ShortestPath,
            TraversalQuery::Cluster(_) => QueryClass::Clustering,
        }
    }

    /// Depth/hop ceiling requested by the query (clustering is bounded by the node set)
    pub fn depth_bound(&self) -> Option<usize> {
        match self {
            TraversalQuery::Chain(p) => Some(p.max_depth),
            TraversalQuery::Rings(p) => Some(p.max_depth),
            TraversalQuery::Path(p) => Some(p.max_hops),
            TraversalQuery::Cluster(_) => None,
        }
    }

    /// Reject depth bounds outside `1..=ceiling`
    pub fn validate(&self, ceiling: usize) -> GraphResult<()> {
        let Some(bound) = self.depth_bound() else {
            return Ok(());
        };
        if bound == 0 || bound > ceiling {
            return Err(GraphError::InvalidParameter(format!(
                "{} depth {} outside 1..={}",
                self.class(),
                bound,
                ceiling
            )));
        }
        Ok(())
    }
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ChainHit {
    pub node: NodeKey,
    /// Minimal depth at which the node was reached
    pub depth: usize,
    /// Lexicographically smallest path at that depth, start included
    pub path: Vec<NodeKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ring {
    /// Rotated to start at the smallest node
    pub nodes: Vec<NodeKey>,
    pub weight: u64,
    /// `edge_weights[i]` is the weight of `nodes[i] → nodes[i + 1]` (wrapping)
    pub edge_weights: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphPath {
    pub nodes: Vec<NodeKey>,
    /// Sum of 1/weight over the hops
    pub cost: f64,
    pub hops: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathOutcome {
    Found(GraphPath),
    NoPath,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub id: usize,
    /// Sorted by node ordering
    pub members: Vec<NodeKey>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Clustering {
    /// Ordered by smallest member; `id` is the position
    pub components: Vec<Component>,
    pub assignment: BTreeMap<NodeKey, usize>,
}

impl Clustering {
    /// Group members by component label and number components by smallest member
    pub fn from_groups(groups: Vec<Vec<NodeKey>>) -> Self {
        let mut groups: Vec<Vec<NodeKey>> = groups
            .into_iter()
            .filter(|g| !g.is_empty())
            .map(|mut g| {
                g.sort();
                g
            })
            .collect();
        groups.sort_by(|a, b| a[0].cmp(&b[0]));

        let mut clustering = Clustering::default();
        for (id, members) in groups.into_iter().enumerate() {
            for member in &members {
                clustering.assignment.insert(member.clone(), id);
            }
            clustering.components.push(Component { id, members });
        }
        clustering
    }

    pub fn component_of(&self, key: &NodeKey) -> Option<usize> {
        self.assignment.get(key).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraversalResult {
    Chain(Vec<ChainHit>),
    Rings(Vec<Ring>),
    Path(PathOutcome),
    Clusters(Clustering),
}

impl TraversalResult {
    /// Number of result items (hits, rings, path nodes, components)
    pub fn item_count(&self) -> u64 {
        match self {
            TraversalResult::Chain(hits) => hits.len() as u64,
            TraversalResult::Rings(rings) => rings.len() as u64,
            TraversalResult::Path(PathOutcome::Found(path)) => path.nodes.len() as u64,
            TraversalResult::Path(PathOutcome::NoPath) => 0,
            TraversalResult::Clusters(clustering) => clustering.components.len() as u64,
        }
    }
}

// ============================================================================
// DEADLINES & PER-QUERY CONTEXT
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Deadline {
            started: Instant::now(),
            limit,
        }
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.limit
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.started.elapsed())
    }

    pub fn limit_ms(&self) -> u128 {
        self.limit.as_millis()
    }
}

/// Why explored branches stopped growing. Counts depend on how an engine
/// enumerates branches, so they compare runs of one backend, not backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchStops {
    pub depth_limit: u64,
    pub cycle: u64,
    pub target_reached: u64,
}

impl BranchStops {
    pub fn record(&mut self, reason: Termination) {
        self.add(reason, 1);
    }

    pub fn add(&mut self, reason: Termination, count: u64) {
        match reason {
            Termination::Open => {}
            Termination::DepthLimit => self.depth_limit += count,
            Termination::Cycle => self.cycle += count,
            Termination::TargetReached => self.target_reached += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.depth_limit + self.cycle + self.target_reached
    }
}

/// Counters and deadline of one traversal execution
#[derive(Debug)]
pub struct QueryContext {
    pub deadline: Deadline,
    pub class: QueryClass,
    pub rows_examined: u64,
    pub frontier_joins: u64,
    pub stops: BranchStops,
}

impl QueryContext {
    pub fn new(class: QueryClass, deadline: Deadline) -> Self {
        QueryContext {
            deadline,
            class,
            rows_examined: 0,
            frontier_joins: 0,
            stops: BranchStops::default(),
        }
    }

    pub fn check(&self) -> GraphResult<()> {
        if self.deadline.expired() {
            return Err(self.timeout());
        }
        Ok(())
    }

    pub fn timeout(&self) -> GraphError {
        GraphError::TraversalTimeout {
            class: self.class,
            limit_ms: self.deadline.limit_ms(),
        }
    }
}

// ============================================================================
// TRAVERSAL PATH (ephemeral)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Open,
    DepthLimit,
    Cycle,
    TargetReached,
}

/// Path under construction; `nodes` doubles as the visited set of the cycle guard
#[derive(Debug, Clone, PartialEq)]
pub struct TraversalPath {
    pub nodes: Vec<NodeId>,
    pub weights: Vec<u64>,
    pub cost: f64,
    pub termination: Termination,
}

impl TraversalPath {
    pub fn start(node: NodeId) -> Self {
        TraversalPath {
            nodes: vec![node],
            weights: Vec::new(),
            cost: 0.0,
            termination: Termination::Open,
        }
    }

    pub fn depth(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn tail(&self) -> NodeId {
        self.nodes[self.nodes.len() - 1]
    }

    pub fn origin(&self) -> NodeId {
        self.nodes[0]
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    /// New path one hop longer; cost grows by 1/weight
    pub fn extend(&self, node: NodeId, weight: u64) -> Self {
        let mut next = self.clone();
        next.nodes.push(node);
        next.weights.push(weight);
        next.cost += hop_cost(weight);
        next
    }

    /// Close the branch and count why it stopped
    pub fn terminate(&mut self, reason: Termination, stops: &mut BranchStops) {
        self.termination = reason;
        stops.record(reason);
    }

    pub fn is_open(&self) -> bool {
        self.termination == Termination::Open
    }
}

/// Cost of traversing a link of the given weight
pub fn hop_cost(weight: u64) -> f64 {
    1.0 / weight as f64
}

/// Rotate a ring so it starts at its smallest node, carrying the edge weights along
pub fn normalize_ring(nodes: Vec<NodeKey>, edge_weights: Vec<u64>, weight: RingWeight) -> Ring {
    let pivot = nodes
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(idx, _)| idx)
        .unwrap_or(0);

    let mut nodes = nodes;
    let mut edge_weights = edge_weights;
    nodes.rotate_left(pivot);
    if edge_weights.len() == nodes.len() {
        edge_weights.rotate_left(pivot);
    }

    Ring {
        weight: weight.combine(&edge_weights),
        nodes,
        edge_weights,
    }
}

/// Heaviest rings first, then by node sequence
pub fn sort_rings(rings: &mut [Ring]) {
    rings.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.nodes.cmp(&b.nodes)));
}

/// Relative tolerance under which two path costs count as tied
pub const COST_EPSILON: f64 = 1e-12;

/// Total order on path costs where values within `COST_EPSILON` are equal,
/// so sums of the same weights in different order still tie
pub fn cmp_cost(a: f64, b: f64) -> Ordering {
    if (a - b).abs() <= COST_EPSILON * a.abs().max(b.abs()) {
        return Ordering::Equal;
    }
    a.total_cmp(&b)
}

/// Smallest by (cost, hops, key path)
pub fn better_path(a: (f64, &[NodeKey]), b: (f64, &[NodeKey])) -> bool {
    cmp_cost(a.0, b.0)
        .then_with(|| a.1.len().cmp(&b.1.len()))
        .then_with(|| a.1.cmp(b.1))
        .is_lt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ring_rotates_to_smallest() {
        let nodes = vec![
            NodeKey::provider("C"),
            NodeKey::provider("A"),
            NodeKey::provider("B"),
        ];
        // C→A = 1, A→B = 2, B→C = 3
        let ring = normalize_ring(nodes, vec![1, 2, 3], RingWeight::Sum);

        assert_eq!(
            ring.nodes,
            vec![NodeKey::provider("A"), NodeKey::provider("B"), NodeKey::provider("C")]
        );
        assert_eq!(ring.edge_weights, vec![2, 3, 1]);
        assert_eq!(ring.weight, 6);
    }

    #[test]
    fn test_ring_weight_min() {
        assert_eq!(RingWeight::Min.combine(&[4, 2, 9]), 2);
        assert_eq!(RingWeight::Sum.combine(&[4, 2, 9]), 15);
    }

    #[test]
    fn test_validate_depth_bounds() {
        let chain = TraversalQuery::Chain(ChainParams::new(NodeKey::provider("P1"), 7));
        assert!(matches!(chain.validate(6), Err(GraphError::InvalidParameter(_))));
        assert!(chain.validate(7).is_ok());

        let rings = TraversalQuery::Rings(RingParams::new(None, 0));
        assert!(rings.validate(6).is_err());

        let cluster = TraversalQuery::Cluster(ClusterParams::new(0));
        assert!(cluster.validate(1).is_ok());
    }

    #[test]
    fn test_zero_deadline_expires_immediately() {
        let ctx = QueryContext::new(QueryClass::Clustering, Deadline::after(Duration::ZERO));
        assert!(matches!(ctx.check(), Err(GraphError::TraversalTimeout { .. })));
    }

    #[test]
    fn test_better_path_ordering() {
        let short = vec![NodeKey::provider("A"), NodeKey::provider("B")];
        let long = vec![NodeKey::provider("A"), NodeKey::provider("C"), NodeKey::provider("B")];

        assert!(better_path((0.5, &short), (0.6, &long)));
        assert!(better_path((0.5, &short), (0.5, &long)), "Fewer hops wins a cost tie");
        assert!(!better_path((0.5, &long), (0.5, &long)));
    }

    #[test]
    fn test_cost_sums_in_different_order_tie() {
        // 1/6 + 1/30 lands one ulp away from 1/5
        let two_hops = hop_cost(6) + hop_cost(30);
        let one_hop = hop_cost(5);
        assert_eq!(cmp_cost(two_hops, one_hop), Ordering::Equal);
        assert_eq!(cmp_cost(one_hop, two_hops), Ordering::Equal);
        assert_eq!(cmp_cost(0.0, 0.0), Ordering::Equal);
        assert_eq!(cmp_cost(0.2, 0.2000001), Ordering::Less);

        let direct = vec![NodeKey::provider("A"), NodeKey::provider("D")];
        let detour = vec![NodeKey::provider("A"), NodeKey::provider("B"), NodeKey::provider("D")];
        assert!(better_path((one_hop, &direct), (two_hops, &detour)));
        assert!(!better_path((two_hops, &detour), (one_hop, &direct)));
    }

    #[test]
    fn test_terminate_counts_branch_stops() {
        let mut stops = BranchStops::default();
        let mut path = TraversalPath::start(1).extend(2, 4);
        assert!(path.is_open());

        path.terminate(Termination::TargetReached, &mut stops);
        assert!(!path.is_open());
        stops.record(Termination::Cycle);
        stops.add(Termination::DepthLimit, 3);
        stops.record(Termination::Open);

        assert_eq!(
            stops,
            BranchStops {
                depth_limit: 3,
                cycle: 1,
                target_reached: 1
            }
        );
        assert_eq!(stops.total(), 5);
    }

    #[test]
    fn test_query_serializes_with_class_tag() {
        let query = TraversalQuery::Cluster(ClusterParams::new(100));
        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(json["class"], "cluster");
        assert_eq!(json["weight_threshold"], 100);
    }
}
