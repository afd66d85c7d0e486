//! Commit log benchmarks for Flowline
//!
//! Run with: cargo bench
//!
//! Measures the append hot path for single records of various sizes and
//! for pre-encoded batches.

use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowline::config::MessageStoreConfig;
use flowline::storage::{
    BatchMessage, CommitLog, Message, MessageBatch, NoHaService, NoopDispatchSink,
    StoreCheckpoint,
};
use tempfile::tempdir;

fn open_commit_log(dir: &std::path::Path) -> CommitLog {
    let config = Arc::new(MessageStoreConfig::with_dir(dir.join("commitlog")));
    let checkpoint = Arc::new(StoreCheckpoint::open(dir.join("checkpoint")).unwrap());
    CommitLog::new(
        config,
        checkpoint,
        Arc::new(NoopDispatchSink),
        Arc::new(NoHaService),
    )
    .unwrap()
}

/// Benchmark single record appends
fn bench_single_append(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let log = open_commit_log(dir.path());
    let body = Bytes::from(vec![b'x'; 100]);

    c.bench_function("single_append_100b", |b| {
        b.iter(|| {
            let mut msg = Message::new("bench-topic", 0, black_box(body.clone()));
            log.put_message(&mut msg)
        })
    });
}

/// Benchmark appends across payload sizes
fn bench_append_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_by_size");

    for size in [100usize, 1_000, 10_000, 100_000].iter() {
        let dir = tempdir().unwrap();
        let log = open_commit_log(dir.path());
        let body = Bytes::from(vec![b'x'; *size]);

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut msg = Message::new("bench-topic", 0, black_box(body.clone()));
                log.put_message(&mut msg)
            })
        });
    }
    group.finish();
}

/// Benchmark batch appends
fn bench_batch_append(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let log = open_commit_log(dir.path());
    let messages: Vec<BatchMessage> = (0..16)
        .map(|_| BatchMessage::new(Bytes::from(vec![b'x'; 100])))
        .collect();

    c.bench_function("batch_append_16x100b", |b| {
        b.iter(|| {
            let mut batch = MessageBatch::new("bench-topic", 0, black_box(messages.clone()));
            log.put_messages(&mut batch)
        })
    });
}

criterion_group!(
    benches,
    bench_single_append,
    bench_append_sizes,
    bench_batch_append
);
criterion_main!(benches);
