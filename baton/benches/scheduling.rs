//! Benchmarks for the scheduling hot paths:
//! - batch submission with dependency validation
//! - selecting eligible jobs in dispatch order
//! - ranking nodes for a job
//! - cycle detection over a large dependency graph

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use baton::*;
use baton_testkit::{MockExecutor, builder, test_config};
use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn eligible_record(i: usize) -> JobRecord {
    let now = Utc::now();
    let priority = match i % 4 {
        0 => JobPriority::Low,
        1 => JobPriority::Normal,
        2 => JobPriority::High,
        _ => JobPriority::Critical,
    };
    let submission =
        JobSubmission::new(JobPayload::new(format!("clip-{i}.mov"))).with_priority(priority);
    let mut record = JobRecord::new(JobId::new(), submission, 3, 3600, i as u64, now);
    record.mark_eligible(now).expect("fresh job is pending");
    record
}

/// Benchmark: submit a batch where every job depends on the previous one.
fn bench_submit_chain(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("submit_chain");
    group.sample_size(20);

    for size in [10usize, 100, 500] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("in_memory", size), &size, |b, &size| {
            let executor = MockExecutor::new();
            let coordinator = builder(test_config(), &executor)
                .build()
                .expect("coordinator should build");

            b.to_async(&rt).iter(|| {
                let coordinator = coordinator.clone();
                async move {
                    let ids: Vec<JobId> = (0..size).map(|_| JobId::new()).collect();
                    let batch = ids
                        .iter()
                        .enumerate()
                        .map(|(i, id)| {
                            let submission =
                                JobSubmission::new(JobPayload::new(format!("part-{i}.mov")))
                                    .with_id(*id);
                            match i.checked_sub(1) {
                                Some(prev) => submission.depends_on(ids[prev]),
                                None => submission,
                            }
                        })
                        .collect();
                    coordinator
                        .submit_batch(batch)
                        .await
                        .expect("submit should succeed");
                }
            });
        });
    }
    group.finish();
}

/// Benchmark: pick the next 64 jobs out of a growing eligible queue.
fn bench_select_eligible(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("select_eligible");
    group.sample_size(30);

    for depth in [100usize, 1_000, 5_000] {
        let store = JobStore::new(Arc::new(InMemoryKvStore::new()), 256);
        rt.block_on(async {
            for i in 0..depth {
                store
                    .insert(&eligible_record(i))
                    .await
                    .expect("insert should succeed");
            }
        });
        let scheduler = PriorityScheduler::new(store);

        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::new("priority", depth), &depth, |b, _| {
            b.to_async(&rt).iter(|| async {
                let selected = scheduler.select(64).await.expect("select should succeed");
                assert!(!selected.is_empty());
            });
        });
    }
    group.finish();
}

/// Benchmark: rank a cluster of nodes for one job.
fn bench_rank_nodes(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("rank_nodes");

    for count in [8usize, 64, 256] {
        let now = Utc::now();
        let nodes: Vec<NodeRecord> = (0..count)
            .map(|i| {
                let mut capabilities = NodeCapabilities::new(10_000 + (i as u32 % 5) * 10_000);
                if i % 3 == 0 {
                    capabilities = capabilities.with_acceleration(HardwareAccel::Nvenc);
                }
                let mut node = NodeRecord::from_registration(
                    NodeRegistration::new(format!("node-{i:03}"), 8)
                        .with_capabilities(capabilities),
                    now,
                );
                node.active_job_count = (i % 8) as u32;
                node
            })
            .collect();
        let balancer = LoadBalancer::new(BalancerWeights::default());
        let job = eligible_record(0);

        group.bench_with_input(BenchmarkId::new("weighted", count), &count, |b, _| {
            b.to_async(&rt).iter(|| async {
                let ranked = balancer.rank(&job, &nodes).await.expect("some node fits");
                assert!(!ranked.is_empty());
            });
        });
    }
    group.finish();
}

/// Benchmark: cycle detection over a wide, layered dependency graph.
fn bench_find_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_cycle");

    for layers in [10usize, 50] {
        let width = 20;
        let ids: Vec<Vec<JobId>> = (0..layers)
            .map(|_| (0..width).map(|_| JobId::new()).collect())
            .collect();
        let mut graph: BTreeMap<JobId, BTreeSet<JobId>> = BTreeMap::new();
        for (layer, row) in ids.iter().enumerate() {
            for id in row {
                let deps = layer
                    .checked_sub(1)
                    .map(|prev| ids[prev].iter().copied().collect())
                    .unwrap_or_default();
                graph.insert(*id, deps);
            }
        }

        group.throughput(Throughput::Elements((layers * width) as u64));
        group.bench_with_input(BenchmarkId::new("layered", layers), &graph, |b, graph| {
            b.iter(|| assert!(find_cycle(graph).is_none()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_submit_chain,
    bench_select_eligible,
    bench_rank_nodes,
    bench_find_cycle
);
criterion_main!(benches);
