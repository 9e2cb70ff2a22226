use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::analyzer::{self, ContentAnalyzer};
use crate::autoscaler::{AutoScaler, ScalingReport};
use crate::balancer::LoadBalancer;
use crate::config::CoordinatorConfig;
use crate::dependency::{DependencyTracker, Evaluation};
use crate::dispatcher::{Dispatcher, PassReport};
use crate::error::{BatonError, Result};
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher, RequeueReason, emit};
use crate::job::{
    JobFilter, JobId, JobRecord, JobState, JobStatusView, JobSubmission,
};
use crate::limiter::SubmissionLimiter;
use crate::node::{LoadSnapshot, NodeId, NodeRecord, NodeRegistration};
use crate::queue::QueueSnapshot;
use crate::registry::NodeRegistry;
use crate::store::{JobCheckpoint, JobCursor, JobStore};
use crate::telemetry;

use super::signal::CancelSignal;

const LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Background duties run by [`Coordinator::start`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Housekeeping {
    Schedule,
    Retries,
    Health,
    AutoScale,
    Purge,
}

impl Housekeeping {
    fn as_str(self) -> &'static str {
        match self {
            Housekeeping::Schedule => "schedule",
            Housekeeping::Retries => "retries",
            Housekeeping::Health => "health",
            Housekeeping::AutoScale => "autoscale",
            Housekeeping::Purge => "purge",
        }
    }
}

/// The coordinator: accepts jobs, tracks nodes and drives every job to a
/// terminal state.
///
/// Cheap to clone; clones share all state. Every operation is usable
/// without [`start`](Self::start); the `*_at` methods let callers drive
/// the background duties by hand.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

pub(crate) struct CoordinatorParts {
    pub config: CoordinatorConfig,
    pub store: JobStore,
    pub registry: NodeRegistry,
    pub tracker: DependencyTracker,
    pub balancer: Arc<LoadBalancer>,
    pub dispatcher: Dispatcher,
    pub autoscaler: Option<AutoScaler>,
    pub analyzer: Option<Arc<dyn ContentAnalyzer>>,
    pub events: Arc<dyn JobEventPublisher>,
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    store: JobStore,
    registry: NodeRegistry,
    tracker: DependencyTracker,
    balancer: Arc<LoadBalancer>,
    dispatcher: Dispatcher,
    autoscaler: Option<AutoScaler>,
    analyzer: Option<Arc<dyn ContentAnalyzer>>,
    events: Arc<dyn JobEventPublisher>,
    limiter: SubmissionLimiter,
    submit_seq: AtomicU64,
    started: AtomicBool,
    shutdown: CancelSignal,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let loops = self
            .inner
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("Coordinator")
            .field("config", &self.inner.config)
            .field("autoscaler", &self.inner.autoscaler.is_some())
            .field("analyzer", &self.inner.analyzer.is_some())
            .field("loops", &loops)
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl Coordinator {
    pub(crate) fn from_parts(parts: CoordinatorParts) -> Self {
        let limiter =
            SubmissionLimiter::per_minute(parts.config.submission.rate_limit_per_minute);
        Self {
            inner: Arc::new(CoordinatorInner {
                config: parts.config,
                store: parts.store,
                registry: parts.registry,
                tracker: parts.tracker,
                balancer: parts.balancer,
                dispatcher: parts.dispatcher,
                autoscaler: parts.autoscaler,
                analyzer: parts.analyzer,
                events: parts.events,
                limiter,
                submit_seq: AtomicU64::new(0),
                started: AtomicBool::new(false),
                shutdown: CancelSignal::new(),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn balancer(&self) -> Arc<LoadBalancer> {
        Arc::clone(&self.inner.balancer)
    }

    // ---- jobs ----

    pub async fn submit(&self, submission: JobSubmission) -> Result<JobId> {
        let mut ids = self.submit_batch(vec![submission]).await?;
        ids.pop()
            .ok_or_else(|| BatonError::InvalidSubmission("empty submission".into()))
    }

    /// Submits jobs atomically with respect to validation: either every
    /// job is accepted or none is written. Dependencies may point at other
    /// jobs in the same batch.
    pub async fn submit_batch(&self, submissions: Vec<JobSubmission>) -> Result<Vec<JobId>> {
        let span = telemetry::submit_span(submissions.len());
        self.submit_batch_inner(submissions).instrument(span).await
    }

    async fn submit_batch_inner(&self, submissions: Vec<JobSubmission>) -> Result<Vec<JobId>> {
        if submissions.is_empty() {
            return Ok(Vec::new());
        }
        let limit = self.inner.config.submission.max_batch_size;
        if submissions.len() > limit {
            return Err(BatonError::InvalidSubmission(format!(
                "batch of {} exceeds the limit of {limit}",
                submissions.len()
            )));
        }
        for submission in &submissions {
            check_submission(submission)?;
        }
        self.inner.limiter.check(submissions.len())?;

        let now = Utc::now();
        let mut records = Vec::with_capacity(submissions.len());
        for mut submission in submissions {
            self.analyze(&mut submission).await;
            let id = submission.id.unwrap_or_default();
            let max_attempts = submission
                .max_attempts
                .unwrap_or(self.inner.config.retry.default_max_attempts);
            let timeout_secs = submission
                .timeout_secs
                .unwrap_or(self.inner.config.submission.default_timeout_secs);
            let seq = self.inner.submit_seq.fetch_add(1, Ordering::SeqCst);
            records.push(JobRecord::new(id, submission, max_attempts, timeout_secs, seq, now));
        }

        let graph: Vec<_> = records
            .iter()
            .map(|record| (record.id, record.dependencies.clone()))
            .collect();
        self.inner.tracker.validate(&graph).await?;

        for record in &records {
            telemetry::record_job_submitted(record.priority.as_str(), record.payload.job_class());
        }
        let outcomes = self.inner.tracker.register(records, now).await?;
        if outcomes
            .iter()
            .any(|(_, outcome)| *outcome == Evaluation::Promoted)
        {
            self.inner.dispatcher.wake_handle().notify_one();
        }
        Ok(outcomes.into_iter().map(|(id, _)| id).collect())
    }

    /// Folds content analysis into the submission. Analysis is advisory; a
    /// failing analyzer never blocks submission.
    async fn analyze(&self, submission: &mut JobSubmission) {
        let Some(analyzer) = &self.inner.analyzer else {
            return;
        };
        if submission.payload.content_profile.is_some() {
            return;
        }
        match analyzer.analyze(&submission.payload.input_ref).await {
            Ok(profile) => analyzer::enrich(submission, profile),
            Err(err) => {
                warn!(input = %submission.payload.input_ref, "content analysis failed: {err:#}");
            }
        }
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatusView> {
        let record = self.inner.store.get(id).await?;
        Ok(JobStatusView::from(&record))
    }

    pub async fn job(&self, id: JobId) -> Result<JobRecord> {
        self.inner.store.get(id).await
    }

    /// Cancels a non-terminal job. Cancelling a terminal job is a
    /// `Conflict`.
    pub async fn cancel(&self, id: JobId) -> Result<JobStatusView> {
        let record = self.inner.dispatcher.cancel(id, Utc::now()).await?;
        Ok(JobStatusView::from(&record))
    }

    pub fn list_jobs(&self, filter: JobFilter) -> JobCursor {
        self.inner.store.list(filter)
    }

    pub fn list_jobs_from(&self, filter: JobFilter, checkpoint: JobCheckpoint) -> JobCursor {
        self.inner.store.list_from(filter, checkpoint)
    }

    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        QueueSnapshot::capture(&self.inner.store, &self.inner.registry, Utc::now()).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe_jobs()
    }

    /// Waits until the job is terminal. Returns `None` on timeout.
    pub async fn wait_for_terminal(
        &self,
        id: JobId,
        timeout: Duration,
    ) -> Result<Option<JobStatusView>> {
        // Subscribe before reading so a transition in between is not missed.
        let mut events = self.subscribe();
        match tokio::time::timeout(timeout, self.await_terminal(id, &mut events)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn await_terminal(
        &self,
        id: JobId,
        events: &mut broadcast::Receiver<JobEvent>,
    ) -> Result<JobStatusView> {
        loop {
            let record = self.inner.store.get(id).await?;
            if record.is_terminal() {
                return Ok(JobStatusView::from(&record));
            }
            loop {
                match events.recv().await {
                    Ok(event) if event.job_id() == id && event.is_terminal() => break,
                    Ok(_) => continue,
                    // Missed events; re-read the store.
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BatonError::Backend(anyhow::anyhow!("event bus closed")));
                    }
                }
            }
        }
    }

    // ---- nodes ----

    pub async fn register_node(&self, registration: NodeRegistration) -> Result<NodeRecord> {
        let node = self.inner.registry.register(registration, Utc::now()).await?;
        self.inner.dispatcher.wake_handle().notify_one();
        Ok(node)
    }

    pub async fn heartbeat(&self, id: &NodeId, load: LoadSnapshot) -> Result<NodeRecord> {
        let node = self.inner.registry.heartbeat(id, load, Utc::now()).await?;
        if node.has_free_slot() && node.status.accepts_work() {
            self.inner.dispatcher.wake_handle().notify_one();
        }
        Ok(node)
    }

    /// Stops assigning work to a node; running jobs finish normally.
    pub async fn drain_node(&self, id: &NodeId) -> Result<NodeRecord> {
        self.inner.registry.drain(id).await
    }

    /// Retires a node immediately and requeues whatever it was running.
    pub async fn deregister_node(&self, id: &NodeId) -> Result<Vec<JobId>> {
        let now = Utc::now();
        self.inner.registry.retire(id).await?;
        let requeued = self
            .inner
            .dispatcher
            .requeue_node(id, RequeueReason::NodeDeregistered, now)
            .await?;
        self.inner.balancer.forget_node(id).await;
        info!(node_id = %id, requeued = requeued.len(), "node deregistered");
        Ok(requeued)
    }

    pub async fn nodes(&self) -> Result<Vec<NodeRecord>> {
        self.inner.registry.list().await
    }

    // ---- background duties ----

    pub async fn run_scheduling_pass(&self) -> Result<PassReport> {
        self.run_scheduling_pass_at(Utc::now()).await
    }

    pub async fn run_scheduling_pass_at(&self, now: DateTime<Utc>) -> Result<PassReport> {
        self.inner
            .dispatcher
            .run_pass(now)
            .instrument(telemetry::scheduling_pass_span())
            .await
    }

    pub async fn promote_due_retries_at(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        self.inner.dispatcher.promote_due_retries(now).await
    }

    /// Marks silent nodes UNREACHABLE and requeues their jobs. Also retries
    /// the requeue for lost nodes that still show load from an earlier,
    /// interrupted sweep, records attempt outcomes and slot releases that
    /// failed to write earlier, and re-evaluates PENDING jobs whose
    /// dependencies finished without promoting or cancelling them.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<NodeId>> {
        self.sweep_inner(now).instrument(telemetry::sweep_span()).await
    }

    async fn sweep_inner(&self, now: DateTime<Utc>) -> Result<Vec<NodeId>> {
        self.inner.dispatcher.settle_pending(now).await;

        let timeout = self.inner.config.health.heartbeat_timeout();
        let lost = self.inner.registry.sweep_at(now, timeout).await?;
        for node in &lost {
            telemetry::record_node_lost(node.id.as_str(), node.active_job_count);
        }

        for node in self.inner.registry.list().await? {
            let newly_lost = lost.iter().any(|l| l.id == node.id);
            if node.status.is_lost() && (newly_lost || node.active_job_count > 0) {
                self.inner
                    .dispatcher
                    .requeue_node(&node.id, RequeueReason::NodeUnreachable, now)
                    .await?;
            }
        }

        if !self.inner.tracker.reevaluate_pending(now).await?.is_empty() {
            self.inner.dispatcher.wake_handle().notify_one();
        }
        Ok(lost.into_iter().map(|node| node.id).collect())
    }

    /// Runs one auto-scaler evaluation. `None` when no provisioner is
    /// configured.
    pub async fn autoscale_at(&self, now: DateTime<Utc>) -> Result<Option<ScalingReport>> {
        let Some(scaler) = &self.inner.autoscaler else {
            return Ok(None);
        };
        let report = scaler
            .evaluate_at(now)
            .instrument(telemetry::autoscale_span())
            .await?;
        Ok(Some(report))
    }

    /// Deletes terminal jobs older than the retention window. Jobs that
    /// still have live dependents are kept.
    pub async fn purge_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(cutoff) = now.checked_sub_signed(self.inner.config.retention.retention())
        else {
            return Ok(0);
        };
        let filter = JobFilter::in_state(JobState::Succeeded)
            .with_state(JobState::Failed)
            .with_state(JobState::Cancelled);
        let expired = |record: &JobRecord| {
            record.is_terminal() && record.completed_at.is_some_and(|at| at < cutoff)
        };

        let mut purged = 0;
        let mut cursor = self.inner.store.list(filter);
        while let Some(record) = cursor.next().await? {
            if !expired(&record) || self.has_live_dependents(&record).await? {
                continue;
            }
            if self.inner.store.remove_if(record.id, expired).await? {
                let mut last = record;
                last.event_seq += 1;
                last.updated_at = now;
                emit(self.inner.events.as_ref(), &last, JobEventPayload::Purged).await;
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "purged expired jobs");
        }
        Ok(purged)
    }

    async fn has_live_dependents(&self, record: &JobRecord) -> Result<bool> {
        for dependent in &record.dependents {
            if let Some(child) = self.inner.store.try_get(*dependent).await?
                && !child.is_terminal()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- lifecycle ----

    /// Recovers jobs left in flight by a previous process, then spawns the
    /// scheduling, retry, health, purge and (if configured) auto-scaler
    /// loops.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(BatonError::conflict("coordinator", "already started"));
        }
        self.inner.dispatcher.recover_in_flight(Utc::now()).await?;

        let config = &self.inner.config;
        let wake = self.inner.dispatcher.wake_handle();
        let mut loops = vec![
            (Housekeeping::Schedule, config.scheduler.pass_interval(), Some(wake)),
            (Housekeeping::Retries, config.scheduler.retry_poll_interval(), None),
            (Housekeeping::Health, config.health.sweep_interval(), None),
            (Housekeeping::Purge, config.retention.purge_interval(), None),
        ];
        if self.inner.autoscaler.is_some() {
            loops.push((Housekeeping::AutoScale, config.autoscaler.interval(), None));
        }

        let mut handles = self.inner.handles.lock().await;
        for (duty, interval, wake) in loops {
            let this = self.clone();
            handles.push(tokio::spawn(this.run_loop(duty, interval, wake)));
        }
        info!(loops = handles.len(), "coordinator started");
        Ok(())
    }

    /// Stops the loops, asks running executors to abort and waits for their
    /// jobs to be requeued.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down coordinator");
        self.inner.shutdown.cancel();

        let handles = {
            let mut guard = self.inner.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(LOOP_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("coordinator loop failed: {err:?}"),
                Err(_) => warn!("coordinator loop timed out during shutdown"),
            }
        }

        self.inner.dispatcher.abort_all().await;
        if !self.inner.dispatcher.wait_idle(DRAIN_TIMEOUT).await {
            warn!(
                in_flight = self.inner.dispatcher.in_flight().await,
                "executors still running after shutdown"
            );
        }
        self.inner.dispatcher.settle_pending(Utc::now()).await;
        let unsettled = self.inner.dispatcher.unsettled().await;
        if unsettled > 0 {
            warn!(unsettled, "attempt outcomes left unrecorded at shutdown");
        }
        info!("coordinator shutdown complete");
        Ok(())
    }

    async fn run_loop(self, duty: Housekeeping, interval: Duration, wake: Option<Arc<Notify>>) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.tick(duty).await {
                Ok(()) => {}
                Err(err) if err.is_transient() => {
                    debug!(duty = duty.as_str(), "housekeeping deferred: {err}");
                }
                Err(err) => error!(duty = duty.as_str(), "housekeeping failed: {err:#}"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = notified(wake.as_deref()) => {}
            }
        }
        debug!(duty = duty.as_str(), "loop stopped");
    }

    async fn tick(&self, duty: Housekeeping) -> Result<()> {
        let now = Utc::now();
        match duty {
            Housekeeping::Schedule => {
                self.run_scheduling_pass_at(now).await?;
            }
            Housekeeping::Retries => {
                self.promote_due_retries_at(now).await?;
            }
            Housekeeping::Health => {
                self.sweep_at(now).await?;
            }
            Housekeeping::AutoScale => {
                self.autoscale_at(now).await?;
            }
            Housekeeping::Purge => {
                self.purge_at(now).await?;
            }
        }
        Ok(())
    }
}

async fn notified(notify: Option<&Notify>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

fn check_submission(submission: &JobSubmission) -> Result<()> {
    if submission.payload.input_ref.trim().is_empty() {
        return Err(BatonError::InvalidSubmission("input_ref is empty".into()));
    }
    if submission.max_attempts == Some(0) {
        return Err(BatonError::InvalidSubmission(
            "max_attempts must be at least 1".into(),
        ));
    }
    if submission.timeout_secs == Some(0) {
        return Err(BatonError::InvalidSubmission(
            "timeout must be at least one second".into(),
        ));
    }
    if let Some(id) = submission.id
        && submission.dependencies.contains(&id)
    {
        return Err(BatonError::InvalidDependencyGraph(format!(
            "job {id} depends on itself"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::job::JobPayload;

    #[test]
    fn test_check_submission_rejects_bad_input() {
        assert!(check_submission(&JobSubmission::new(JobPayload::new("in.mov"))).is_ok());
        assert!(matches!(
            check_submission(&JobSubmission::new(JobPayload::new("  "))),
            Err(BatonError::InvalidSubmission(_))
        ));
        assert!(matches!(
            check_submission(
                &JobSubmission::new(JobPayload::new("in.mov")).with_max_attempts(0)
            ),
            Err(BatonError::InvalidSubmission(_))
        ));

        let id = JobId::new();
        let looped = JobSubmission::new(JobPayload::new("in.mov"))
            .with_id(id)
            .depends_on(id);
        assert!(matches!(
            check_submission(&looped),
            Err(BatonError::InvalidDependencyGraph(_))
        ));
    }

    #[tokio::test]
    async fn test_notified_without_handle_never_fires() {
        let fired = tokio::time::timeout(Duration::from_millis(20), notified(None)).await;
        assert!(fired.is_err());

        let notify = Notify::new();
        notify.notify_one();
        tokio::time::timeout(Duration::from_millis(20), notified(Some(&notify)))
            .await
            .unwrap();
    }
}
