//! Throughput benchmarks for relaykv
//!
//! Covers the hot paths: store reads and writes, decoding pipelined client
//! input, and committing writes to a leader with attached replicas.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relaykv::protocol::{RespDecoder, RespValue};
use relaykv::replication::ReplicaRegistry;
use relaykv::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;

fn bench_set(c: &mut Criterion) {
    let engine = StorageEngine::new();

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i));
            engine.set(key, Bytes::from_static(b"small_value"), None);
            i += 1;
        });
    });

    group.bench_function("set_with_ttl", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("ttl:{}", i));
            engine.set(key, Bytes::from_static(b"value"), Some(Duration::from_secs(3600)));
            i += 1;
        });
    });

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let engine = StorageEngine::new();
    for i in 0..100_000 {
        engine.set(
            Bytes::from(format!("key:{}", i)),
            Bytes::from(format!("value:{}", i)),
            None,
        );
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i % 100_000));
            black_box(engine.get(&key));
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("missing:{}", i));
            black_box(engine.get(&key));
            i += 1;
        });
    });

    group.finish();
}

fn bench_keys(c: &mut Criterion) {
    let engine = StorageEngine::new();
    for i in 0..10_000 {
        engine.set(Bytes::from(format!("user:{}", i)), Bytes::from_static(b"v"), None);
    }

    c.bench_function("keys_all_10k", |b| {
        b.iter(|| black_box(engine.keys("*").map(|keys| keys.len())));
    });
}

fn bench_decode(c: &mut Criterion) {
    let mut wire = Vec::new();
    for i in 0..100 {
        RespValue::command(["SET".to_string(), format!("key:{}", i), "value".to_string()])
            .serialize_into(&mut wire);
    }

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(wire.len() as u64));

    group.bench_function("pipelined_100_sets", |b| {
        b.iter(|| {
            let mut decoder = RespDecoder::new();
            decoder.extend(&wire);
            let mut count = 0;
            while let Some(value) = decoder.decode() {
                black_box(value);
                count += 1;
            }
            assert_eq!(count, 100);
        });
    });

    group.bench_function("byte_chunks_of_16", |b| {
        b.iter(|| {
            let mut decoder = RespDecoder::new();
            let mut count = 0;
            for chunk in wire.chunks(16) {
                decoder.extend(chunk);
                while decoder.decode().is_some() {
                    count += 1;
                }
            }
            assert_eq!(count, 100);
        });
    });

    group.finish();
}

fn bench_commit(c: &mut Criterion) {
    let storage = StorageEngine::new();
    storage.set_replication_meta("bench", 0);
    let registry = Arc::new(ReplicaRegistry::new(None));
    let mut subscriptions: Vec<_> = (0..4).map(|_| registry.subscribe(&storage)).collect();

    let frame = Bytes::from(RespValue::command(["SET", "key", "value"]).serialize());

    let mut group = c.benchmark_group("replication");
    group.throughput(Throughput::Elements(1));

    group.bench_function("commit_to_4_replicas", |b| {
        b.iter(|| {
            registry.commit(&storage, frame.clone(), || {
                storage.set(Bytes::from_static(b"key"), Bytes::from_static(b"value"), None);
            });
        });
        // Keep the channels from growing without bound between samples.
        for sub in subscriptions.iter_mut() {
            while sub.try_recv().is_some() {}
        }
    });

    group.finish();
}

criterion_group!(benches, bench_set, bench_get, bench_keys, bench_decode, bench_commit);

criterion_main!(benches);
