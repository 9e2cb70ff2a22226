//! Tracing and telemetry instrumentation for baton.
//!
//! Span constructors and `record_*` helpers used across the coordinator.
//! Every helper logs through `tracing`; with the `metrics` feature enabled
//! it also updates the matching Prometheus series in [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use baton::telemetry::{dispatch_span, record_job_dispatched};
//!
//! let span = dispatch_span(job_id, "node-1", "h264_720p");
//! let _enter = span.enter();
//! record_job_dispatched("node-1", "h264_720p");
//! ```

use std::future::Future;
use tracing::{Instrument, Span, info_span};

/// Span covering one submission call.
#[must_use]
pub fn submit_span(jobs: usize) -> Span {
    info_span!("baton.submit", jobs = jobs)
}

/// Span covering one attempt of a job on a node.
///
/// # Arguments
/// * `job_id` - The job being run
/// * `node_id` - The node it was assigned to
/// * `job_class` - The preset or `default`
#[must_use]
pub fn dispatch_span(
    job_id: impl AsRef<str>,
    node_id: impl AsRef<str>,
    job_class: impl AsRef<str>,
) -> Span {
    info_span!(
        "baton.dispatch",
        job_id = %job_id.as_ref(),
        node_id = %node_id.as_ref(),
        job_class = %job_class.as_ref(),
    )
}

/// Span covering one scheduling pass.
#[must_use]
pub fn scheduling_pass_span() -> Span {
    info_span!("baton.schedule")
}

/// Span covering one health sweep.
#[must_use]
pub fn sweep_span() -> Span {
    info_span!("baton.sweep")
}

/// Span covering one auto-scaler evaluation.
#[must_use]
pub fn autoscale_span() -> Span {
    info_span!("baton.autoscale")
}

/// Runs `future` inside a [`dispatch_span`].
pub fn instrument_dispatch<F>(
    job_id: impl AsRef<str>,
    node_id: impl AsRef<str>,
    job_class: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(job_id, node_id, job_class))
}

pub fn record_job_submitted(priority: impl AsRef<str>, job_class: impl AsRef<str>) {
    tracing::info!(
        priority = %priority.as_ref(),
        job_class = %job_class.as_ref(),
        "job submitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted(priority.as_ref(), job_class.as_ref());
}

pub fn record_job_dispatched(node_id: impl AsRef<str>, job_class: impl AsRef<str>) {
    tracing::info!(
        node_id = %node_id.as_ref(),
        job_class = %job_class.as_ref(),
        "job dispatched"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_dispatched(node_id.as_ref());
}

/// Record the end of an attempt.
///
/// # Arguments
/// * `job_class` - The preset or `default`
/// * `status` - `succeeded`, `retrying`, `failed` or `deadline_exceeded`
pub fn record_job_completed(job_class: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::info!(
        job_class = %job_class.as_ref(),
        status = %status.as_ref(),
        "job attempt finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_completed(job_class.as_ref(), status.as_ref());
}

/// Record a job reaching CANCELLED. `reason` is `user` or
/// `dependency_failed`.
pub fn record_job_cancelled(reason: impl AsRef<str>) {
    tracing::info!(reason = %reason.as_ref(), "job cancelled");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_cancelled(reason.as_ref());
}

pub fn record_job_requeued(node_id: impl AsRef<str>, reason: impl AsRef<str>) {
    tracing::warn!(
        node_id = %node_id.as_ref(),
        reason = %reason.as_ref(),
        "job requeued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_requeued(reason.as_ref());
}

pub fn record_node_lost(node_id: impl AsRef<str>, active_jobs: u32) {
    tracing::warn!(
        node_id = %node_id.as_ref(),
        active_jobs = active_jobs,
        "node lost"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_node_lost();
}

/// Record an auto-scaler decision that changed the pool.
pub fn record_scaling_action(action: impl AsRef<str>, pressure: f64) {
    tracing::info!(
        action = %action.as_ref(),
        pressure = pressure,
        "scaling action"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_scaling_action(action.as_ref());
}

/// Update the eligible-queue depth gauge for one priority level.
pub fn set_queue_depth(priority: impl AsRef<str>, depth: usize) {
    tracing::debug!(
        priority = %priority.as_ref(),
        depth = depth,
        "queue depth updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(priority.as_ref(), depth as f64);
}

pub fn set_cluster_pressure(pressure: f64) {
    tracing::debug!(pressure = pressure, "cluster pressure updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_cluster_pressure(pressure);
}

pub fn observe_job_duration(
    job_class: impl AsRef<str>,
    status: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::debug!(
        job_class = %job_class.as_ref(),
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(
        job_class.as_ref(),
        status.as_ref(),
        duration_secs,
    );
}

/// Start timing an attempt. Pass the handle to [`record_job_end`].
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

pub fn record_job_end(
    handle: JobTimingHandle,
    job_class: impl AsRef<str>,
    status: impl AsRef<str>,
) {
    observe_job_duration(job_class, status, handle.start.elapsed().as_secs_f64());
}

/// Opaque timer returned by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
