// Claims Graph Bench - Core Library
// Graph model over relational claim records, traversal engine, backends and harness

pub mod error;
pub mod config;
pub mod records;        // Claim records + CSV loader
pub mod entities;       // Node and edge models
pub mod builder;        // Graph Model Builder
pub mod db;             // SQLite graph tables
pub mod traversal;      // Traversal Engine
pub mod backend;        // Backend Adapter (sqlite, columnar)
pub mod bench;          // Benchmark Harness

// Re-export commonly used types
pub use error::{GraphError, GraphResult};
pub use config::BenchConfig;
pub use records::{
    ClaimRecord, ClaimRow, LoadReport, MalformedReason,
    load_claims_csv, parse_month,
};
pub use entities::{
    BucketGranularity, EntityKind, EntityNode, NodeId, NodeKey,
    RelationType, RelationshipEdge, ALL_TIME_BUCKET,
};
pub use builder::{BuildStats, GraphModelBuilder, GraphTables};
pub use db::{setup_database, write_graph, graph_counts, load_nodes, load_edges};
pub use traversal::{
    BranchStops, ChainHit, ChainParams, ClusterParams, Clustering, Component, Deadline,
    Direction, GraphPath, PathOutcome, PathParams, QueryClass, QueryContext, Ring, RingParams,
    RingWeight, Termination, TraversalQuery, TraversalResult,
};
pub use backend::{
    AdapterOptions, BackendAdapter, BackendFactory, GraphBackend, RebuildGate, Support,
    TraversalOutcome, ColumnarFactory, ColumnarStore, SqliteBackend, SqliteFactory,
};
pub use bench::{
    BenchmarkHarness, BenchmarkReport, BenchmarkRunRecord, CacheMode, HarnessOptions,
    Operation, OperationSummary, ResourceSampler, ResultStore, Workload, summarize,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
