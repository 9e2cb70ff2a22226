//! Runs a small simulated transcoding cluster in-process.
//!
//! Three nodes with different capabilities process a batch of jobs with
//! dependencies. One job fails once and is retried; one needs a GPU node.
//! Job events are printed as they happen.
//!
//! Run with `RUST_LOG=baton=debug cargo run --example local_cluster` for
//! more detail. Pass a path as the first argument to persist state to a
//! JSON file instead of memory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use baton::*;
use tracing_subscriber::EnvFilter;

/// Pretends to transcode: reports progress in steps, and fails the first
/// attempt of any input whose name contains "flaky".
struct SimulatedEncoder {
    flaked: AtomicBool,
}

#[async_trait]
impl ProcessingExecutor for SimulatedEncoder {
    async fn execute(
        &self,
        task: ExecutionTask,
        progress: ProgressReporter,
        abort: CancelSignal,
    ) -> anyhow::Result<ExecutionOutcome> {
        let input = &task.payload.input_ref;
        println!(
            "[{}] encoding {input} (attempt {})",
            task.node.id, task.attempt
        );
        if input.contains("flaky") && !self.flaked.swap(true, Ordering::SeqCst) {
            return Ok(ExecutionOutcome::retryable("encoder segfault"));
        }

        for step in 1..=4 {
            tokio::select! {
                _ = abort.cancelled() => return Ok(ExecutionOutcome::retryable("aborted")),
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
            progress.report(step as f64 / 4.0);
        }
        Ok(ExecutionOutcome::Succeeded)
    }
}

/// Tags inputs that look like animation so the encoder gets tuned settings.
struct FilenameAnalyzer;

#[async_trait]
impl ContentAnalyzer for FilenameAnalyzer {
    async fn analyze(&self, input_ref: &str) -> anyhow::Result<ContentProfile> {
        let animated = input_ref.contains("anime");
        let mut profile = ContentProfile {
            content_type: if animated { "animation" } else { "live_action" }.into(),
            confidence: 0.6,
            ..Default::default()
        };
        if animated {
            profile
                .recommended_parameters
                .insert("tune".into(), serde_json::json!("animation"));
        }
        Ok(profile)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = CoordinatorConfig::default();
    config.scheduler.pass_interval_ms = 50;
    config.retry.base_delay_ms = 200;

    let mut builder = CoordinatorBuilder::new(config)
        .with_executor(Arc::new(SimulatedEncoder {
            flaked: AtomicBool::new(false),
        }))
        .with_analyzer(Arc::new(FilenameAnalyzer));
    if let Some(path) = std::env::args().nth(1) {
        builder = builder.with_kv_store(Arc::new(JsonFileKvStore::open(&path).await?));
    }
    let coordinator = builder.build()?;

    coordinator
        .register_node(
            NodeRegistration::new("cpu-1", 2).with_capabilities(NodeCapabilities::new(20_000)),
        )
        .await?;
    coordinator
        .register_node(
            NodeRegistration::new("cpu-2", 1).with_capabilities(NodeCapabilities::new(10_000)),
        )
        .await?;
    coordinator
        .register_node(
            NodeRegistration::new("gpu-1", 2).with_capabilities(
                NodeCapabilities::new(80_000)
                    .with_acceleration(HardwareAccel::Nvenc)
                    .with_format("hevc"),
            ),
        )
        .await?;

    let mut events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event.payload {
                JobEventPayload::Progress { .. } => {}
                payload => println!("  event {:<10} {}", payload.name(), event.job_id()),
            }
        }
    });

    let (inspect, master, proxy) = (JobId::new(), JobId::new(), JobId::new());
    let ids = coordinator
        .submit_batch(vec![
            JobSubmission::new(JobPayload::new("s01e01.mov").with_preset("inspect"))
                .with_id(inspect),
            JobSubmission::new(
                JobPayload::new("s01e01.mov")
                    .with_preset("hevc-2160p")
                    .with_requirements(
                        JobRequirements::default()
                            .with_acceleration(HardwareAccel::Nvenc)
                            .with_format("hevc"),
                    ),
            )
            .with_id(master)
            .depends_on(inspect)
            .with_priority(JobPriority::High),
            JobSubmission::new(JobPayload::new("s01e01.mov").with_preset("h264-480p"))
                .with_id(proxy)
                .depends_on(inspect),
            JobSubmission::new(JobPayload::new("anime-opening.mkv").with_preset("h264-1080p")),
            JobSubmission::new(JobPayload::new("flaky-trailer.mov").with_preset("h264-1080p")),
        ])
        .await?;

    coordinator.start().await?;

    for id in &ids {
        match coordinator.wait_for_terminal(*id, Duration::from_secs(30)).await? {
            Some(status) => println!(
                "{id}: {} after {} failed attempt(s)",
                status.state, status.attempt_count
            ),
            None => println!("{id}: still running"),
        }
    }

    let snapshot = coordinator.queue_snapshot().await?;
    println!(
        "queue: {} jobs, {} eligible, pressure {:.2}",
        snapshot.total_jobs(),
        snapshot.eligible(),
        snapshot.pressure()
    );

    coordinator.shutdown().await?;
    printer.abort();
    Ok(())
}
