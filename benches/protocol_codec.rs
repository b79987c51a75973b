//! Benchmarks for coordination message handling
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lsl_coord::coordination::Topology;
use lsl_coord::protocol::{decode, encode, CoordinationMessage, MessagePayload, RecentMessages};
use lsl_coord::types::{NetworkNode, NodeRole};

fn nodes(count: usize) -> Vec<NetworkNode> {
    (0..count)
        .map(|i| {
            NetworkNode::new(format!("node-{:04}", i), format!("Node {}", i))
                .with_role(if i == 0 { NodeRole::Coordinator } else { NodeRole::Participant })
                .with_metadata("cpu_cores", 4 + (i % 8) as u64)
        })
        .collect()
}

fn topology_message(count: usize) -> CoordinationMessage {
    CoordinationMessage::new(
        "bench",
        "node-0000",
        MessagePayload::TopologyUpdate {
            coordinator_id: "node-0000".to_string(),
            nodes: nodes(count),
        },
    )
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_encode");

    let heartbeat = CoordinationMessage::new(
        "bench",
        "node-0001",
        MessagePayload::Heartbeat {
            role: NodeRole::Participant,
        },
    );
    group.throughput(Throughput::Elements(1));
    group.bench_function("heartbeat", |b| b.iter(|| encode(black_box(&heartbeat))));

    for size in [4, 32, 256].iter() {
        let message = topology_message(*size);
        group.bench_with_input(BenchmarkId::new("topology", size), size, |b, _| {
            b.iter(|| encode(black_box(&message)))
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_decode");

    for size in [4, 32, 256].iter() {
        let raw = match encode(&topology_message(*size)) {
            Ok(raw) => raw,
            Err(e) => panic!("encode failed: {}", e),
        };
        group.throughput(Throughput::Bytes(raw.len() as u64));
        group.bench_with_input(BenchmarkId::new("topology", size), size, |b, _| {
            b.iter(|| decode(black_box(&raw)))
        });
    }

    group.finish();
}

fn bench_topology_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("topology_apply_update");

    for size in [4, 32, 256].iter() {
        let update = nodes(*size);
        let mut changed = update.clone();
        if let Some(last) = changed.last_mut() {
            *last = last.with_metadata("cpu_cores", 64u64);
        }

        group.bench_with_input(BenchmarkId::new("unchanged", size), size, |b, _| {
            let mut topology = Topology::new();
            topology.apply_update(update.clone());
            b.iter(|| topology.apply_update(black_box(update.clone())))
        });
        group.bench_with_input(BenchmarkId::new("one_changed", size), size, |b, _| {
            b.iter(|| {
                let mut topology = Topology::new();
                topology.apply_update(update.clone());
                topology.apply_update(black_box(changed.clone()))
            })
        });
    }

    group.finish();
}

fn bench_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup");
    let ids: Vec<String> = (0..4096).map(|i| format!("msg-{}", i)).collect();

    group.throughput(Throughput::Elements(ids.len() as u64));
    group.bench_function("check_and_insert_4096", |b| {
        b.iter(|| {
            let mut recent = RecentMessages::new(1024);
            for id in &ids {
                black_box(recent.check_and_insert("node-0001", id));
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_topology_apply, bench_dedup);
criterion_main!(benches);
