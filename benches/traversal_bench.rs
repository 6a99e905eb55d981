//! Referral chain walks on a synthetic claims graph
//!
//! Providers bill a ring of shared procedures and refer to their neighbours,
//! so chains fan out quickly with depth.

use claims_graph_bench::{
    AdapterOptions, BackendAdapter, BackendFactory, ChainParams, ClaimRecord, ColumnarFactory,
    ColumnarStore, NodeKey, RebuildGate, SqliteBackend, TraversalQuery,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(60);

/// Deterministic claims: provider i bills procedures i % p and (i * 7) % p, refers to i + 1
fn generate_records(providers: usize, procedures: usize) -> Vec<ClaimRecord> {
    let mut records = Vec::with_capacity(providers * 3);
    for i in 0..providers {
        let provider = format!("NPI{:06}", i);
        records.push(ClaimRecord::billed_for(&provider, &format!("HC{:04}", i % procedures), 10 + (i % 17) as u64));
        records.push(ClaimRecord::billed_for(&provider, &format!("HC{:04}", (i * 7) % procedures), 5 + (i % 11) as u64));
        records.push(ClaimRecord::referred_to(&provider, &format!("NPI{:06}", (i + 1) % providers), 1 + (i % 5) as u64));
    }
    records
}

fn options() -> AdapterOptions {
    AdapterOptions {
        max_depth: 8,
        ..AdapterOptions::default()
    }
}

fn sqlite_adapter(records: &[ClaimRecord]) -> BackendAdapter {
    let backend = SqliteBackend::in_memory().expect("in-memory sqlite");
    let adapter = BackendAdapter::new(Box::new(backend), Arc::new(RebuildGate::new()), options());
    adapter.execute_build(records, TIMEOUT).expect("sqlite build");
    adapter
}

fn columnar_adapter(records: &[ClaimRecord]) -> BackendAdapter {
    let factory = ColumnarFactory::new(Arc::new(ColumnarStore::new()), Arc::new(RebuildGate::new()), options());
    let adapter = factory.connect().expect("columnar session");
    adapter.execute_build(records, TIMEOUT).expect("columnar build");
    adapter
}

fn bench_chain_walk(c: &mut Criterion) {
    let records = generate_records(2_000, 200);
    let adapters = [
        ("sqlite", sqlite_adapter(&records)),
        ("columnar", columnar_adapter(&records)),
    ];

    let mut group = c.benchmark_group("Referral Chain");
    group.sample_size(10);

    for (name, adapter) in &adapters {
        for depth in [2usize, 4, 6] {
            let query = TraversalQuery::Chain(ChainParams::new(NodeKey::provider("NPI000000"), depth));
            group.bench_with_input(BenchmarkId::new(*name, depth), &query, |b, query| {
                b.iter(|| black_box(adapter.execute_traversal(query, TIMEOUT).expect("chain walk")));
            });
        }
    }

    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("Graph Build");
    group.sample_size(10);

    for providers in [500usize, 2_000] {
        let records = generate_records(providers, providers / 10);
        group.bench_with_input(BenchmarkId::new("columnar", providers), &records, |b, records| {
            let adapter = columnar_adapter(records);
            b.iter(|| black_box(adapter.execute_build(records, TIMEOUT).expect("build")));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_chain_walk, bench_build);
criterion_main!(benches);
