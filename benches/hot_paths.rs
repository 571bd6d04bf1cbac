//! Hot path benchmarks for the staging pipeline.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! Every admission builds a staged file name, every cycle decodes and sorts
//! them, and every aggregate is streamed through gzip.

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use insights_gateway::staging::aggregator::write_aggregate;
use insights_gateway::staging::naming::{
    batched_name, decode_batched_name, decode_specimen_name, query_escape, specimen_name,
};
use std::path::PathBuf;

const NANOS: i64 = 1_717_200_000_123_456_789;

fn bench_batched_name(c: &mut Criterion) {
    let mut group = c.benchmark_group("batched_name");
    group.throughput(Throughput::Elements(1));

    group.bench_function("encode", |b| {
        b.iter(|| batched_name(black_box(NANOS), black_box(42), black_box("alice")))
    });

    let name = batched_name(NANOS, 42, "alice");
    group.bench_function("decode", |b| b.iter(|| decode_batched_name(black_box(&name))));

    group.finish();
}

fn bench_specimen_name(c: &mut Criterion) {
    let mut group = c.benchmark_group("specimen_name");
    group.throughput(Throughput::Elements(1));

    let at = Utc.timestamp_nanos(NANOS);
    for (label, uri) in [
        ("short", "http://example.com/a.png"),
        ("escaped", "https://example.com/some path/Screen Shot 2024?x=1&y=2#top"),
    ] {
        group.bench_function(format!("encode_{}", label), |b| {
            b.iter(|| specimen_name(black_box(at), black_box(7), black_box(uri)))
        });

        let name = specimen_name(at, 7, uri);
        group.bench_function(format!("decode_{}", label), |b| {
            b.iter(|| decode_specimen_name(black_box(&name)))
        });
    }

    group.finish();
}

fn bench_query_escape(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_escape");

    for len in [32, 256, 2048] {
        let uri: String = "http://example.com/a b/c?d=e&"
            .chars()
            .cycle()
            .take(len)
            .collect();
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(format!("len_{}", len), |b| b.iter(|| query_escape(black_box(&uri))));
    }

    group.finish();
}

/// Concatenate and gzip N staged records
fn bench_write_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_aggregate");
    let dir = tempfile::TempDir::new().unwrap();

    for count in [10usize, 100, 1000] {
        let sources: Vec<(String, PathBuf)> = (0..count)
            .map(|i| {
                let name = batched_name(NANOS + i as i64, i as u64, "bench");
                let path = dir.path().join(&name);
                let body = format!(r#"{{"event":"tick","seq":{},"pad":"{}"}}"#, i, "x".repeat(128));
                std::fs::write(&path, body).unwrap();
                (name, path)
            })
            .collect();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("records_{}", count), |b| {
            b.iter(|| {
                let (compressed, written) = write_aggregate(Vec::new(), black_box(&sources)).unwrap();
                black_box((compressed.len(), written))
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_batched_name,
    bench_specimen_name,
    bench_query_escape,
    bench_write_aggregate,
);

criterion_main!(benches);
