//! Several coordinators over one key-value store, and restarts over a
//! durable one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use baton::*;
use baton_testkit::*;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_racing_coordinators_dispatch_each_job_once() {
    init_tracing();
    let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
    let executor = MockExecutor::with_default(Step::Hang);
    let first = builder(test_config(), &executor)
        .with_kv_store(kv.clone())
        .build()
        .unwrap();
    let second = builder(test_config(), &executor)
        .with_kv_store(kv)
        .build()
        .unwrap();

    first.register_node(node("shared", 3)).await.unwrap();
    for i in 0..10 {
        first.submit(transcode(&format!("race-{i}.mov"))).await.unwrap();
    }

    let mut dispatched = Vec::new();
    for _ in 0..10 {
        let (a, b) = tokio::join!(first.run_scheduling_pass(), second.run_scheduling_pass());
        dispatched.extend(a.unwrap().dispatched);
        dispatched.extend(b.unwrap().dispatched);
    }

    let unique: HashSet<_> = dispatched.iter().map(|(id, _)| *id).collect();
    assert_eq!(unique.len(), dispatched.len(), "a job was dispatched twice");
    assert_eq!(dispatched.len(), 3);

    assert!(executor.wait_for_calls(3, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    executor.assert_call_count_eq(3);
    let executed: HashSet<_> = executor.calls().iter().map(|c| c.job_id).collect();
    assert_eq!(executed, unique);

    let node = first.registry().get(&NodeId::new("shared")).await.unwrap();
    assert_eq!(node.active_job_count, 3);
    let eligible = second
        .list_jobs(JobFilter::in_state(JobState::Eligible))
        .collect()
        .await
        .unwrap();
    assert_eq!(eligible.len(), 7);
}

#[tokio::test]
async fn test_cancel_from_other_coordinator_is_seen() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
    let executor = MockExecutor::new();
    let submitter = builder(test_config(), &executor)
        .with_kv_store(kv.clone())
        .build()
        .unwrap();
    let canceller = builder(test_config(), &executor)
        .with_kv_store(kv)
        .build()
        .unwrap();

    let id = submitter.submit(transcode("shared.mov")).await.unwrap();
    canceller.cancel(id).await.unwrap();

    submitter.register_node(node("n1", 1)).await.unwrap();
    let report = submitter.run_scheduling_pass().await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(submitter.status(id).await.unwrap().state, JobState::Cancelled);
    executor.assert_call_count_eq(0);
}

#[tokio::test]
async fn test_restart_recovers_in_flight_jobs_from_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("baton-state.json");

    let crashed = MockExecutor::with_default(Step::Hang);
    let before = builder(test_config(), &crashed)
        .with_kv_store(Arc::new(JsonFileKvStore::open(&path).await.unwrap()))
        .build()
        .unwrap();
    before.register_node(node("n1", 2)).await.unwrap();
    let encode = before.submit(transcode("episode.mov")).await.unwrap();
    let package = before
        .submit(transcode("episode-package.mov").depends_on(encode))
        .await
        .unwrap();
    before.run_scheduling_pass().await.unwrap();
    assert!(crashed.wait_for_calls(1, WAIT).await);
    timeout(WAIT, async {
        while before.status(encode).await.unwrap().state != JobState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // A second process opens the same file; the first never finishes.
    let executor = MockExecutor::new();
    let after = builder(test_config(), &executor)
        .with_kv_store(Arc::new(JsonFileKvStore::open(&path).await.unwrap()))
        .build()
        .unwrap();
    let reloaded = after.status(encode).await.unwrap();
    assert_eq!(reloaded.state, JobState::Running);
    assert_eq!(after.status(package).await.unwrap().state, JobState::Pending);

    let mut rx = after.subscribe();
    after.start().await.unwrap();

    let requeued = timeout(WAIT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.job_id() == encode
                && let JobEventPayload::Requeued { reason, .. } = event.payload
            {
                return reason;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(requeued, RequeueReason::Recovered);

    let status = after.wait_for_terminal(package, WAIT).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    let encoded = after.status(encode).await.unwrap();
    assert_eq!(encoded.state, JobState::Succeeded);
    assert_eq!(encoded.attempt_count, 0);
    after.shutdown().await.unwrap();

    let node = after.registry().get(&NodeId::new("n1")).await.unwrap();
    assert_eq!(node.active_job_count, 0);
}
