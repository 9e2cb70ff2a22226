//! Prometheus metrics for the coordinator.
//!
//! Compiled only with the `metrics` feature. The helpers here are called
//! from [`crate::telemetry`]; callers normally go through that module.
//!
//! # Metrics
//!
//! ## Counters
//! - `baton_jobs_submitted_total` - Jobs accepted by submit
//! - `baton_jobs_dispatched_total` - Attempts started, per node
//! - `baton_jobs_completed_total` - Attempts finished, per outcome
//! - `baton_jobs_cancelled_total` - Jobs cancelled, per reason
//! - `baton_jobs_requeued_total` - Jobs returned to the queue
//! - `baton_nodes_lost_total` - Nodes marked unreachable
//! - `baton_scaling_actions_total` - Auto-scaler actions
//!
//! ## Gauges
//! - `baton_queue_depth` - Eligible jobs per priority
//! - `baton_cluster_pressure` - Eligible jobs per active slot
//!
//! ## Histograms
//! - `baton_job_duration_seconds` - Attempt duration
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramVec, IntCounter, Opts, Registry,
    exponential_buckets,
};
use std::sync::LazyLock;

/// Global Prometheus registry for baton metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `priority`, `job_class`.
pub static JOBS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("baton_jobs_submitted_total", "Total number of jobs submitted");
    CounterVec::new(opts, &["priority", "job_class"])
        .expect("baton_jobs_submitted_total metric creation failed")
});

/// Labels: `node_id`.
pub static JOBS_DISPATCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "baton_jobs_dispatched_total",
        "Total number of job attempts started",
    );
    CounterVec::new(opts, &["node_id"])
        .expect("baton_jobs_dispatched_total metric creation failed")
});

/// Labels: `job_class`, `status` (succeeded, retrying, failed,
/// deadline_exceeded).
pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "baton_jobs_completed_total",
        "Total number of job attempts finished",
    );
    CounterVec::new(opts, &["job_class", "status"])
        .expect("baton_jobs_completed_total metric creation failed")
});

/// Labels: `reason`.
pub static JOBS_CANCELLED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("baton_jobs_cancelled_total", "Total number of jobs cancelled");
    CounterVec::new(opts, &["reason"])
        .expect("baton_jobs_cancelled_total metric creation failed")
});

/// Labels: `reason`.
pub static JOBS_REQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "baton_jobs_requeued_total",
        "Total number of jobs returned to the queue without consuming an attempt",
    );
    CounterVec::new(opts, &["reason"])
        .expect("baton_jobs_requeued_total metric creation failed")
});

pub static NODES_LOST_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("baton_nodes_lost_total", "Total number of nodes marked unreachable")
        .expect("baton_nodes_lost_total metric creation failed")
});

/// Labels: `action` (scale_up, drain, retire).
pub static SCALING_ACTIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "baton_scaling_actions_total",
        "Total number of auto-scaler actions",
    );
    CounterVec::new(opts, &["action"])
        .expect("baton_scaling_actions_total metric creation failed")
});

/// Labels: `priority`.
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("baton_queue_depth", "Eligible jobs waiting for a node");
    GaugeVec::new(opts, &["priority"]).expect("baton_queue_depth metric creation failed")
});

pub static CLUSTER_PRESSURE: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new(
        "baton_cluster_pressure",
        "Eligible jobs divided by active node capacity",
    )
    .expect("baton_cluster_pressure metric creation failed")
});

/// Labels: `job_class`, `status`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 18).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "baton_job_duration_seconds",
        "Job attempt duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_class", "status"])
        .expect("baton_job_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_DISPATCHED_TOTAL.clone()),
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(JOBS_CANCELLED_TOTAL.clone()),
        Box::new(JOBS_REQUEUED_TOTAL.clone()),
        Box::new(NODES_LOST_TOTAL.clone()),
        Box::new(SCALING_ACTIONS_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(CLUSTER_PRESSURE.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_submitted(priority: &str, job_class: &str) {
    JOBS_SUBMITTED_TOTAL
        .with_label_values(&[priority, job_class])
        .inc();
}

pub fn record_job_dispatched(node_id: &str) {
    JOBS_DISPATCHED_TOTAL.with_label_values(&[node_id]).inc();
}

pub fn record_job_completed(job_class: &str, status: &str) {
    JOBS_COMPLETED_TOTAL
        .with_label_values(&[job_class, status])
        .inc();
}

pub fn record_job_cancelled(reason: &str) {
    JOBS_CANCELLED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_job_requeued(reason: &str) {
    JOBS_REQUEUED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_node_lost() {
    NODES_LOST_TOTAL.inc();
}

pub fn record_scaling_action(action: &str) {
    SCALING_ACTIONS_TOTAL.with_label_values(&[action]).inc();
}

pub fn set_queue_depth(priority: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[priority]).set(depth);
}

pub fn set_cluster_pressure(pressure: f64) {
    // Infinite pressure (work but no capacity) is exported as -1.
    CLUSTER_PRESSURE.set(if pressure.is_finite() { pressure } else { -1.0 });
}

pub fn observe_job_duration(job_class: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_class, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should be a no-op");
    }

    #[test]
    fn test_record_helpers() {
        record_job_submitted("high", "h264_720p");
        record_job_dispatched("node-1");
        record_job_completed("h264_720p", "succeeded");
        record_job_completed("h264_720p", "retrying");
        record_job_cancelled("dependency_failed");
        record_job_requeued("node_unreachable");
        record_node_lost();
        record_scaling_action("scale_up");
        set_queue_depth("critical", 3.0);
        set_cluster_pressure(f64::INFINITY);
        observe_job_duration("h264_720p", "succeeded", 12.5);
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_submitted("normal", "default");
        record_job_completed("default", "succeeded");

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("baton_jobs_submitted_total"));
        assert!(output.contains("baton_jobs_completed_total"));
    }
}
