//! Benchmarks for subscription routing and emission.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pipelet::core::{Operation, StageId, UpdateMode};
use pipelet::graph::{Graph, GraphConfig};
use pipelet::plug::SourceOptions;
use pipelet::query::{QueryChanges, QueryRouter, Term};
use pipelet::stages::PassThrough;
use serde_json::{json, Value};

fn term(value: Value) -> Term {
    value.as_object().cloned().unwrap_or_default()
}

fn values(count: usize) -> Vec<Value> {
    (0..count).map(|i| json!({"id": i, "bucket": i % 16})).collect()
}

fn router_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("router");
    for destinations in [4_u32, 64, 512] {
        let mut router = QueryRouter::new();
        for d in 0..destinations {
            let destination = StageId::new(d);
            router.register(destination);
            router.add(&[term(json!({ "bucket": d % 16 }))], destination);
        }
        let add = Operation::Add(values(256));
        let update = Operation::Update(
            values(64)
                .into_iter()
                .map(|old| {
                    let mut new = old.clone();
                    new["bucket"] = json!((old["bucket"].as_u64().unwrap_or(0) + 1) % 16);
                    (old, new)
                })
                .collect(),
        );

        group.bench_with_input(BenchmarkId::new("add", destinations), &add, |b, op| {
            b.iter(|| black_box(router.route(op, UpdateMode::Strict)))
        });
        group.bench_with_input(BenchmarkId::new("update", destinations), &update, |b, op| {
            b.iter(|| black_box(router.route(op, UpdateMode::Split)))
        });
    }
    group.finish();
}

fn emit_benchmark(c: &mut Criterion) {
    let Ok(mut graph) = Graph::new(GraphConfig::new("bench").with_emit_events(false)) else {
        return;
    };
    let source = graph.add_stage("source", PassThrough);
    for d in 0..16 {
        let sink = graph.add_stage(format!("sink-{d}"), PassThrough);
        let _ = graph.add_source(sink, source, SourceOptions::no_fetch());
        let _ = graph.update_upstream_query(sink, QueryChanges::adding(vec![term(json!({ "bucket": d }))]));
    }

    let batch = values(128);
    c.bench_function("emit_add_16_destinations", |b| {
        b.iter(|| graph.emit_add(source, black_box(batch.clone())))
    });
}

criterion_group!(benches, router_benchmark, emit_benchmark);
criterion_main!(benches);
