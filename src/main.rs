use anyhow::{Context, Result};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use claims_graph_bench::{
    load_claims_csv, AdapterOptions, BackendFactory, BenchConfig, BenchmarkHarness,
    ColumnarFactory, ColumnarStore, GraphModelBuilder, HarnessOptions, RebuildGate,
    ResultStore, SqliteFactory, Workload,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let (config_path, csv_path) = match args.as_slice() {
        [csv] => (None, csv.as_str()),
        [config, csv] => (Some(config.as_str()), csv.as_str()),
        _ => {
            eprintln!("Usage: claims-graph-bench [config.json] <claims.csv>");
            std::process::exit(2);
        }
    };

    run_benchmark(config_path, Path::new(csv_path))
}

fn run_benchmark(config_path: Option<&str>, csv_path: &Path) -> Result<()> {
    println!("📊 Claims Graph Benchmark v{}", claims_graph_bench::VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // 1. Configuration
    let config = match config_path {
        Some(path) => BenchConfig::from_file(path)?,
        None => BenchConfig::default(),
    }
    .with_env_overrides()?;
    config.validate().context("Invalid benchmark configuration")?;

    // 2. Claims
    let (records, report) = load_claims_csv(csv_path)?;
    println!(
        "✓ Loaded {} claim records from {} rows ({} rejected)",
        report.records_emitted, report.rows_read, report.rows_rejected
    );

    // 3. Start nodes come from an in-memory build of the same records
    let tables = GraphModelBuilder::new(config.time_bucket)
        .build(&records)
        .context("Failed to build graph model")?;
    let workload = Workload::standard(records, &tables, &config);
    info!(
        nodes = tables.stats.node_count,
        edges = tables.stats.edge_count,
        traversals = workload.traversal_count(),
        "Workload ready"
    );

    // 4. Backends
    let options = AdapterOptions::from_config(&config);
    let sqlite = SqliteFactory::new(&config.sqlite_path, Arc::new(RebuildGate::new()), options);
    let columnar = ColumnarFactory::new(
        Arc::new(ColumnarStore::new()),
        Arc::new(RebuildGate::new()),
        options,
    );
    let targets: [&dyn BackendFactory; 2] = [&sqlite, &columnar];

    // 5. Measure
    let harness = BenchmarkHarness::new(HarnessOptions::from_config(&config))
        .with_store(ResultStore::new(&config.results_path));
    let report = harness.run(&workload, &targets);

    for summary in &report.summaries {
        info!(
            backend = %summary.backend,
            operation = %summary.operation,
            cache_mode = %summary.cache_mode,
            runs = summary.runs,
            failures = summary.failures,
            median_ms = summary.median_ms.unwrap_or(0.0),
            p95_ms = summary.p95_ms.unwrap_or(0.0),
            throughput = summary.throughput,
            peak_rss_bytes = summary.peak_rss_bytes,
            "Summary"
        );
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "✅ {} runs recorded ({} failed) → {:?}",
        report.records.len(),
        report.failures(),
        config.results_path
    );

    Ok(())
}
