// 🎯 Workload - What the harness measures, in the order it measures it

use crate::builder::GraphTables;
use crate::config::BenchConfig;
use crate::records::ClaimRecord;
use crate::traversal::{
    ChainParams, ClusterParams, Direction, PathParams, QueryClass, RingParams, TraversalQuery,
};
use tracing::warn;

pub const BUILD_OPERATION: &str = "build";

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Build the graph tables from the workload records
    Build,
    Traversal { name: String, query: TraversalQuery },
}

impl Operation {
    pub fn traversal(name: &str, query: TraversalQuery) -> Self {
        Operation::Traversal {
            name: name.to_string(),
            query,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Operation::Build => BUILD_OPERATION,
            Operation::Traversal { name, .. } => name,
        }
    }

    pub fn query_class(&self) -> Option<QueryClass> {
        match self {
            Operation::Build => None,
            Operation::Traversal { query, .. } => Some(query.class()),
        }
    }

    pub fn is_build(&self) -> bool {
        matches!(self, Operation::Build)
    }
}

#[derive(Debug, Clone)]
pub struct Workload {
    pub records: Vec<ClaimRecord>,
    /// Build first, traversals in the order given
    pub operations: Vec<Operation>,
}

impl Workload {
    pub fn new(records: Vec<ClaimRecord>, mut operations: Vec<Operation>) -> Self {
        // Traversals need a graph; stable sort keeps traversal order
        operations.sort_by_key(|op| !op.is_build());
        Workload { records, operations }
    }

    /// Build plus one query per class, probing the highest-volume providers
    pub fn standard(records: Vec<ClaimRecord>, tables: &GraphTables, config: &BenchConfig) -> Self {
        let anchors = tables.top_providers(2);
        let mut operations = vec![Operation::Build];

        match anchors.first() {
            Some(first) => {
                operations.push(Operation::traversal(
                    "referral_chain",
                    TraversalQuery::Chain(ChainParams::new(first.clone(), config.max_depth)),
                ));

                let mut rings = RingParams::new(Some(first.clone()), config.max_depth);
                rings.weight = config.ring_weight;
                operations.push(Operation::traversal("ring_detection", TraversalQuery::Rings(rings)));

                if let Some(second) = anchors.get(1) {
                    let mut path = PathParams::new(first.clone(), second.clone(), config.max_depth);
                    path.direction = Direction::Both;
                    operations.push(Operation::traversal("shortest_path", TraversalQuery::Path(path)));
                }
            }
            None => warn!("No provider nodes in the graph, skipping start-node queries"),
        }

        operations.push(Operation::traversal(
            "clustering",
            TraversalQuery::Cluster(ClusterParams::new(config.cluster_weight_threshold)),
        ));

        Workload::new(records, operations)
    }

    pub fn traversal_count(&self) -> usize {
        self.operations.iter().filter(|op| !op.is_build()).count()
    }
}
