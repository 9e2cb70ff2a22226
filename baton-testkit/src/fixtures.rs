use std::sync::Arc;

use baton::*;
use tracing_subscriber::EnvFilter;

use crate::mock::MockExecutor;

/// Installs a fmt subscriber once per process. Honours `RUST_LOG`,
/// defaulting to `warn` so test output stays quiet.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Configuration with short loop intervals and no submission throttling.
/// The heartbeat timeout stays long; tests drive node loss through
/// `sweep_at` with an explicit clock.
pub fn test_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.scheduler.pass_interval_ms = 10;
    config.scheduler.retry_poll_interval_ms = 10;
    config.retry.base_delay_ms = 10;
    config.retry.max_backoff_ms = 50;
    config.health.heartbeat_timeout_ms = 60_000;
    config.health.sweep_interval_ms = 20;
    config.submission.rate_limit_per_minute = 0;
    config.autoscaler.interval_ms = 20;
    config
}

pub fn node(id: &str, capacity: u32) -> NodeRegistration {
    NodeRegistration::new(id, capacity).with_capabilities(NodeCapabilities::new(20_000))
}

pub fn gpu_node(id: &str, capacity: u32) -> NodeRegistration {
    NodeRegistration::new(id, capacity).with_capabilities(
        NodeCapabilities::new(50_000)
            .with_acceleration(HardwareAccel::Nvenc)
            .with_format("hevc"),
    )
}

pub fn transcode(input: &str) -> JobSubmission {
    JobSubmission::new(JobPayload::new(input).with_preset("h264-1080p"))
}

pub fn transcode_with(input: &str, priority: JobPriority) -> JobSubmission {
    transcode(input).with_priority(priority)
}

/// A job only a node with NVENC and HEVC support can run.
pub fn gpu_transcode(input: &str) -> JobSubmission {
    JobSubmission::new(
        JobPayload::new(input)
            .with_preset("hevc-2160p")
            .with_parameter("crf", 22)
            .with_requirements(
                JobRequirements::default()
                    .with_acceleration(HardwareAccel::Nvenc)
                    .with_format("hevc"),
            ),
    )
}

pub fn coordinator(executor: &MockExecutor) -> Coordinator {
    coordinator_with(test_config(), executor)
}

pub fn coordinator_with(config: CoordinatorConfig, executor: &MockExecutor) -> Coordinator {
    builder(config, executor)
        .build()
        .expect("test coordinator should build")
}

/// Builder pre-wired with `executor`, for tests that add more parts.
pub fn builder(config: CoordinatorConfig, executor: &MockExecutor) -> CoordinatorBuilder {
    CoordinatorBuilder::new(config).with_executor(Arc::new(executor.clone()))
}
