//! Store write failures while attempts finish: outcomes must still be
//! recorded and node slots returned once the store accepts writes again.

use std::sync::Arc;
use std::time::Duration;

use baton::*;
use baton_testkit::*;
use chrono::Utc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn faulty_coordinator(executor: &MockExecutor) -> (Coordinator, FaultyKvStore) {
    let kv = FaultyKvStore::new(Arc::new(InMemoryKvStore::new()));
    let coordinator = builder(test_config(), executor)
        .with_kv_store(Arc::new(kv.clone()))
        .build()
        .unwrap();
    (coordinator, kv)
}

async fn node_load(coordinator: &Coordinator, id: &str) -> u32 {
    coordinator
        .registry()
        .get(&NodeId::new(id))
        .await
        .unwrap()
        .active_job_count
}

async fn wait_for_injected(kv: &FaultyKvStore, count: usize) {
    timeout(WAIT, async {
        while kv.injected() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("only {} of {count} faults injected", kv.injected()));
}

#[tokio::test]
async fn test_success_survives_one_failed_write() {
    init_tracing();
    let executor = MockExecutor::new();
    let (coordinator, kv) = faulty_coordinator(&executor);
    kv.fail_writes(1, FaultyKvStore::job_entering(JobState::Succeeded));

    coordinator.register_node(node("solo", 1)).await.unwrap();
    let first = coordinator.submit(transcode("first.mov")).await.unwrap();
    let second = coordinator.submit(transcode("second.mov")).await.unwrap();
    coordinator.start().await.unwrap();

    for id in [first, second] {
        let status = coordinator.wait_for_terminal(id, WAIT).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Succeeded);
    }
    assert_eq!(kv.injected(), 1);
    executor.assert_call_count_eq(2);
    coordinator.shutdown().await.unwrap();
    assert_eq!(node_load(&coordinator, "solo").await, 0);
}

#[tokio::test]
async fn test_outage_outlasting_attempt_retries_is_settled_by_sweep() {
    init_tracing();
    let executor = MockExecutor::new();
    let (coordinator, kv) = faulty_coordinator(&executor);
    coordinator.register_node(node("solo", 1)).await.unwrap();
    let encode = coordinator.submit(transcode("encode.mov")).await.unwrap();
    let package = coordinator
        .submit(transcode("package.mov").depends_on(encode))
        .await
        .unwrap();

    // The attempt task gives up after four tries; two more fail in sweeps.
    kv.fail_writes(6, FaultyKvStore::job_entering(JobState::Succeeded));
    coordinator.run_scheduling_pass().await.unwrap();
    wait_for_injected(&kv, 4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(coordinator.status(encode).await.unwrap().state, JobState::Running);
    assert_eq!(node_load(&coordinator, "solo").await, 1);

    let mut sweeps = 0;
    while coordinator.status(encode).await.unwrap().state != JobState::Succeeded {
        assert!(sweeps < 10, "outcome never recorded");
        coordinator.sweep_at(Utc::now()).await.unwrap();
        sweeps += 1;
    }
    assert_eq!(sweeps, 3);
    assert_eq!(kv.injected(), 6);
    executor.assert_call_count_eq(1);

    assert_eq!(node_load(&coordinator, "solo").await, 0);
    assert_eq!(coordinator.status(package).await.unwrap().state, JobState::Eligible);
}

#[tokio::test]
async fn test_failed_slot_release_is_retried_by_sweep() {
    let executor = MockExecutor::new();
    let (coordinator, kv) = faulty_coordinator(&executor);
    coordinator.register_node(node("solo", 1)).await.unwrap();
    kv.fail_writes(1, FaultyKvStore::node_emptied("solo"));

    let id = coordinator.submit(transcode("clip.mov")).await.unwrap();
    coordinator.run_scheduling_pass().await.unwrap();
    let status = coordinator.wait_for_terminal(id, WAIT).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    wait_for_injected(&kv, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(node_load(&coordinator, "solo").await, 1);

    coordinator.sweep_at(Utc::now()).await.unwrap();
    assert_eq!(node_load(&coordinator, "solo").await, 0);

    let next = coordinator.submit(transcode("next.mov")).await.unwrap();
    let report = coordinator.run_scheduling_pass().await.unwrap();
    assert_eq!(report.dispatched, vec![(next, NodeId::new("solo"))]);
}

#[tokio::test]
async fn test_executor_panic_counts_as_retryable_failure() {
    let executor = MockExecutor::new();
    let coordinator = coordinator(&executor);
    coordinator.register_node(node("solo", 1)).await.unwrap();
    let id = coordinator.submit(transcode("crashy.mov")).await.unwrap();
    executor.script_job(id, [Step::Panic("decoder blew up".into())]);

    coordinator.start().await.unwrap();
    let status = coordinator.wait_for_terminal(id, WAIT).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.attempt_count, 1);
    executor.assert_call_count_eq(2);
    coordinator.shutdown().await.unwrap();
    assert_eq!(node_load(&coordinator, "solo").await, 0);
}
