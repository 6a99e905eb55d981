// End-to-end: claims → graph tables → traversals on both backends → harness records

use claims_graph_bench::{
    AdapterOptions, BackendAdapter, BackendFactory, BenchConfig, BenchmarkHarness, CacheMode,
    ChainParams, ClaimRecord, ClusterParams, ColumnarFactory, ColumnarStore, Direction,
    GraphError, GraphResult, HarnessOptions, NodeKey, Operation, PathOutcome, PathParams,
    RebuildGate, RingParams, SqliteFactory, TraversalQuery, TraversalResult, Workload,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(30);

fn create_scenario_records() -> Vec<ClaimRecord> {
    vec![
        ClaimRecord::billed_for("P1", "Proc1", 10),
        ClaimRecord::billed_for("P1", "Proc2", 5),
        ClaimRecord::billed_for("P2", "Proc1", 3),
    ]
}

fn create_factories(dir: &tempfile::TempDir) -> (SqliteFactory, ColumnarFactory) {
    let options = AdapterOptions::default();
    let sqlite = SqliteFactory::new(
        dir.path().join("claims_graph.db"),
        Arc::new(RebuildGate::new()),
        options,
    );
    let columnar = ColumnarFactory::new(
        Arc::new(ColumnarStore::new()),
        Arc::new(RebuildGate::new()),
        options,
    );
    (sqlite, columnar)
}

fn built_adapter(factory: &dyn BackendFactory) -> BackendAdapter {
    let adapter = factory.connect().unwrap();
    let stats = adapter.execute_build(&create_scenario_records(), TIMEOUT).unwrap();
    assert_eq!(stats.node_count, 4, "{}: two providers, two procedures", factory.name());
    assert_eq!(stats.edge_count, 3, "{}: three edges", factory.name());
    adapter
}

fn run(adapter: &BackendAdapter, query: TraversalQuery) -> TraversalResult {
    adapter.execute_traversal(&query, TIMEOUT).unwrap().result
}

#[test]
fn test_scenario_chain_on_both_backends() {
    let dir = tempfile::tempdir().unwrap();
    let (sqlite, columnar) = create_factories(&dir);

    for factory in [&sqlite as &dyn BackendFactory, &columnar] {
        let adapter = built_adapter(factory);
        assert_eq!(adapter.graph_counts().unwrap(), (4, 3));

        let query = TraversalQuery::Chain(ChainParams::new(NodeKey::provider("P1"), 2));
        let TraversalResult::Chain(hits) = run(&adapter, query) else {
            panic!("{}: expected chain result", factory.name());
        };

        let depths: BTreeMap<NodeKey, usize> = hits.iter().map(|h| (h.node.clone(), h.depth)).collect();
        let expected: BTreeMap<NodeKey, usize> = [
            (NodeKey::procedure("Proc1"), 1),
            (NodeKey::procedure("Proc2"), 1),
            (NodeKey::provider("P2"), 2),
        ]
        .into_iter()
        .collect();
        assert_eq!(depths, expected, "{}: minimal depths", factory.name());

        let p2 = hits.iter().find(|h| h.node == NodeKey::provider("P2")).unwrap();
        assert_eq!(
            p2.path,
            vec![NodeKey::provider("P1"), NodeKey::procedure("Proc1"), NodeKey::provider("P2")],
            "{}: reached via the shared procedure",
            factory.name()
        );
    }

    println!("✅ End-to-end chain scenario PASSED on both backends");
}

#[test]
fn test_backends_agree_on_every_query_class() {
    let dir = tempfile::tempdir().unwrap();
    let (sqlite, columnar) = create_factories(&dir);

    let mut records = create_scenario_records();
    // Close a referral ring P1 → P2 → P3 → P1
    records.push(ClaimRecord::referred_to("P1", "P2", 4));
    records.push(ClaimRecord::referred_to("P2", "P3", 6));
    records.push(ClaimRecord::referred_to("P3", "P1", 2));

    let sqlite_adapter = sqlite.connect().unwrap();
    let columnar_adapter = columnar.connect().unwrap();
    sqlite_adapter.execute_build(&records, TIMEOUT).unwrap();
    columnar_adapter.execute_build(&records, TIMEOUT).unwrap();

    let chain = TraversalQuery::Chain(ChainParams::new(NodeKey::provider("P3"), 3));
    assert_eq!(run(&sqlite_adapter, chain.clone()), run(&columnar_adapter, chain));

    let rings = TraversalQuery::Rings(RingParams::new(None, 4));
    let sqlite_rings = run(&sqlite_adapter, rings.clone());
    assert_eq!(sqlite_rings, run(&columnar_adapter, rings));
    let TraversalResult::Rings(found) = sqlite_rings else {
        panic!("expected rings");
    };
    assert_eq!(found.len(), 1, "One ring, reported once");
    assert_eq!(found[0].nodes[0], NodeKey::provider("P1"), "Rotated to the smallest node");
    assert_eq!(found[0].weight, 12);

    let clusters = TraversalQuery::Cluster(ClusterParams::new(4));
    assert_eq!(run(&sqlite_adapter, clusters.clone()), run(&columnar_adapter, clusters));

    let mut path = PathParams::new(NodeKey::provider("P3"), NodeKey::procedure("Proc2"), 4);
    path.direction = Direction::Both;
    let query = TraversalQuery::Path(path);
    match (run(&sqlite_adapter, query.clone()), run(&columnar_adapter, query)) {
        (
            TraversalResult::Path(PathOutcome::Found(a)),
            TraversalResult::Path(PathOutcome::Found(b)),
        ) => {
            assert_eq!(a.nodes, b.nodes);
            assert_eq!(a.hops, b.hops);
            assert!((a.cost - b.cost).abs() < 1e-9);
        }
        other => panic!("Expected a path on both backends, got {:?}", other),
    }
}

#[test]
fn test_rounding_never_beats_fewer_hops() {
    let dir = tempfile::tempdir().unwrap();
    let (sqlite, columnar) = create_factories(&dir);
    // 1/6 + 1/30 == 1/5, though not in f64
    let records = vec![
        ClaimRecord::referred_to("A", "B", 6),
        ClaimRecord::referred_to("B", "D", 30),
        ClaimRecord::referred_to("A", "D", 5),
    ];

    for factory in [&sqlite as &dyn BackendFactory, &columnar] {
        let adapter = factory.connect().unwrap();
        adapter.execute_build(&records, TIMEOUT).unwrap();

        let query = TraversalQuery::Path(PathParams::new(NodeKey::provider("A"), NodeKey::provider("D"), 3));
        let TraversalResult::Path(PathOutcome::Found(path)) = run(&adapter, query) else {
            panic!("{}: expected a path", factory.name());
        };
        assert_eq!(path.hops, 1, "{}", factory.name());
        assert_eq!(path.nodes, vec![NodeKey::provider("A"), NodeKey::provider("D")]);
        assert_eq!(path.cost, 0.2);
    }
}

#[test]
fn test_rebuild_is_idempotent_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let (sqlite, _) = create_factories(&dir);

    built_adapter(&sqlite);
    // Second connection, same file, same records
    let adapter = built_adapter(&sqlite);
    assert_eq!(adapter.graph_counts().unwrap(), (4, 3));

    // Shrinking input drops stale nodes and edges
    let stats = adapter
        .execute_build(&create_scenario_records()[..1], TIMEOUT)
        .unwrap();
    assert_eq!(stats.node_count, 2);
    assert_eq!(adapter.graph_counts().unwrap(), (2, 1));
}

struct OfflineFactory;

impl BackendFactory for OfflineFactory {
    fn name(&self) -> &str {
        "offline"
    }

    fn connect(&self) -> GraphResult<BackendAdapter> {
        Err(GraphError::unavailable("offline", "no route to host"))
    }
}

#[test]
fn test_harness_isolates_unavailable_backend() {
    let dir = tempfile::tempdir().unwrap();
    let (sqlite, columnar) = create_factories(&dir);

    let records = create_scenario_records();
    let workload = Workload::new(
        records,
        vec![
            Operation::Build,
            Operation::traversal(
                "referral_chain",
                TraversalQuery::Chain(ChainParams::new(NodeKey::provider("P1"), 2)),
            ),
        ],
    );

    let harness = BenchmarkHarness::new(HarnessOptions {
        repetitions: 2,
        cache_modes: vec![CacheMode::Cold, CacheMode::Warm],
        timeout: TIMEOUT,
    });
    let targets: [&dyn BackendFactory; 3] = [&sqlite, &OfflineFactory, &columnar];
    let report = harness.run(&workload, &targets);

    let offline: Vec<_> = report.records_for("offline").collect();
    assert_eq!(offline.len(), 1, "Exactly one failed record for the unavailable backend");
    assert_eq!(offline[0].error_kind.as_deref(), Some("BackendUnavailable"));

    for backend in ["sqlite", "columnar"] {
        let runs: Vec<_> = report.records_for(backend).collect();
        // 2 operations x 2 modes x 2 repetitions
        assert_eq!(runs.len(), 8, "{}", backend);
        assert!(runs.iter().all(|r| r.success), "{}", backend);

        let chain = runs.iter().find(|r| r.operation == "referral_chain").unwrap();
        assert_eq!(chain.result_items, 3);
    }
    assert_eq!(report.failures(), 1);
}

#[test]
fn test_standard_workload_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let (sqlite, columnar) = create_factories(&dir);
    let config = BenchConfig {
        repetitions: 1,
        cache_modes: vec![CacheMode::Warm],
        ..BenchConfig::default()
    };

    let records = create_scenario_records();
    let tables = claims_graph_bench::GraphModelBuilder::new(config.time_bucket)
        .build(&records)
        .unwrap();
    let workload = Workload::standard(records, &tables, &config);

    let targets: [&dyn BackendFactory; 2] = [&sqlite, &columnar];
    let report = BenchmarkHarness::new(HarnessOptions::from_config(&config)).run(&workload, &targets);

    assert_eq!(report.failures(), 0);
    assert_eq!(report.records.len(), 2 * workload.operations.len());
    assert_eq!(report.summaries.len(), 2 * workload.operations.len());
}
