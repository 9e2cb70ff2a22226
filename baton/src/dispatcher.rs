//! Dispatch loop: places eligible jobs on nodes and drives each attempt to
//! its outcome.
//!
//! A job is claimed (ELIGIBLE -> ASSIGNED) by one atomic store update
//! before the executor is invoked, so two passes racing for the same job
//! produce exactly one winner. Every later write for an attempt is checked
//! against the `dispatch_seq` it was issued under; results from an attempt
//! that was superseded (requeued, cancelled, timed out) are dropped.
//!
//! Node slots follow the job: whoever applies the transition that takes a
//! job out of ASSIGNED/RUNNING releases the slot it held.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::balancer::LoadBalancer;
use crate::dependency::DependencyTracker;
use crate::error::{BatonError, Result};
use crate::events::{JobEventPayload, JobEventPublisher, RequeueReason, emit};
use crate::executor::{ExecutionOutcome, ExecutionTask, ProcessingExecutor, ProgressReporter};
use crate::job::{JobError, JobErrorKind, JobFilter, JobId, JobRecord, JobState};
use crate::node::{NodeId, NodeRecord};
use crate::registry::NodeRegistry;
use crate::retry::RetryPolicy;
use crate::runtime::CancelSignal;
use crate::scheduler::Scheduler;
use crate::store::JobStore;
use crate::telemetry;

/// How long an aborted executor gets to return before its task stops
/// waiting for it.
const ABORT_GRACE: Duration = Duration::from_secs(5);

const PROGRESS_BUFFER: usize = 16;

/// Tries an attempt task makes at recording its outcome before parking it
/// for the health sweep.
const SETTLE_TRIES: u32 = 4;
const SETTLE_BACKOFF: Duration = Duration::from_millis(50);

/// Result of one scheduling pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PassReport {
    pub dispatched: Vec<(JobId, NodeId)>,
    /// Eligible jobs left waiting because no node could take them.
    pub deferred: Vec<JobId>,
    /// Eligible jobs failed because their deadline passed in the queue.
    pub expired: Vec<JobId>,
}

#[derive(Clone, Debug)]
struct RunningAttempt {
    dispatch_seq: u64,
    abort: CancelSignal,
}

enum AttemptEnd {
    Finished(anyhow::Result<ExecutionOutcome>),
    DeadlineExceeded,
    Aborted,
}

/// How an attempt ended, as far as the job record is concerned.
#[derive(Clone, Debug)]
enum Verdict {
    Succeeded,
    Failed { message: String, retryable: bool },
    DeadlineExceeded,
    Requeue(RequeueReason),
}

/// An attempt outcome on its way into the store.
#[derive(Clone, Debug)]
struct Settlement {
    job_id: JobId,
    dispatch_seq: u64,
    node_id: NodeId,
    class: String,
    verdict: Verdict,
}

impl Settlement {
    /// Whether `record` already carries this outcome. Only outcomes no
    /// other party can produce under the same `dispatch_seq` are matched.
    fn landed_in(&self, record: &JobRecord) -> bool {
        if record.dispatch_seq != self.dispatch_seq {
            return false;
        }
        let kind = record.error.as_ref().map(|error| error.kind);
        match self.verdict {
            Verdict::Succeeded => record.state == JobState::Succeeded,
            Verdict::Failed { .. } => {
                record.state == JobState::Failed && kind == Some(JobErrorKind::ExecutorFailure)
            }
            Verdict::DeadlineExceeded => {
                record.state == JobState::Failed && kind == Some(JobErrorKind::DeadlineExceeded)
            }
            Verdict::Requeue(_) => false,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: JobStore,
    registry: NodeRegistry,
    scheduler: Arc<dyn Scheduler>,
    balancer: Arc<LoadBalancer>,
    tracker: DependencyTracker,
    retry: RetryPolicy,
    executor: Arc<dyn ProcessingExecutor>,
    events: Arc<dyn JobEventPublisher>,
    running: Arc<Mutex<HashMap<JobId, RunningAttempt>>>,
    unsettled: Arc<Mutex<Vec<Settlement>>>,
    owed_slots: Arc<Mutex<Vec<NodeId>>>,
    wake: Arc<Notify>,
    max_per_pass: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_per_pass", &self.max_per_pass)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: JobStore,
        registry: NodeRegistry,
        scheduler: Arc<dyn Scheduler>,
        balancer: Arc<LoadBalancer>,
        tracker: DependencyTracker,
        retry: RetryPolicy,
        executor: Arc<dyn ProcessingExecutor>,
        events: Arc<dyn JobEventPublisher>,
        max_per_pass: usize,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
            balancer,
            tracker,
            retry,
            executor,
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
            unsettled: Arc::new(Mutex::new(Vec::new())),
            owed_slots: Arc::new(Mutex::new(Vec::new())),
            wake: Arc::new(Notify::new()),
            max_per_pass: max_per_pass.max(1),
        }
    }

    /// Notified whenever capacity frees up or new work becomes eligible.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Number of attempts whose tasks are still alive.
    pub async fn in_flight(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Places up to `max_per_pass` eligible jobs, in dispatch order.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let mut report = PassReport::default();
        let candidates = self.scheduler.select(self.max_per_pass).await?;
        if candidates.is_empty() {
            return Ok(report);
        }
        let mut nodes = self.registry.list().await?;

        for job in candidates {
            if job.is_past_deadline(now) {
                if self.expire(job.id, now).await? {
                    report.expired.push(job.id);
                }
                continue;
            }
            match self.place(&job, &mut nodes, now).await {
                Ok(Some(node_id)) => report.dispatched.push((job.id, node_id)),
                Ok(None) => {}
                Err(BatonError::NoAvailableNodes(id)) => report.deferred.push(id),
                Err(err) => return Err(err),
            }
        }

        if !report.deferred.is_empty() {
            debug!(deferred = report.deferred.len(), "jobs waiting for capacity");
        }
        Ok(report)
    }

    /// Tries the ranked candidates in order until one accepts the job.
    /// Returns `Ok(None)` if another pass claimed the job first.
    async fn place(
        &self,
        job: &JobRecord,
        nodes: &mut Vec<NodeRecord>,
        now: DateTime<Utc>,
    ) -> Result<Option<NodeId>> {
        let ranked = self.balancer.rank(job, nodes).await?;

        for candidate in ranked {
            let node = match self.registry.acquire_slot(&candidate.node_id).await {
                Ok(node) => node,
                Err(err) if err.is_conflict() || err.is_not_found() => {
                    debug!(node_id = %candidate.node_id, "candidate rejected slot: {err}");
                    nodes.retain(|n| n.id != candidate.node_id);
                    continue;
                }
                Err(err) => return Err(err),
            };
            replace_node(nodes, node.clone());

            let claimed = self
                .store
                .update_expecting(job.id, &[JobState::Eligible], |record| {
                    record.assign(node.id.clone(), now).map(|_| ())
                })
                .await;
            match claimed {
                Ok(record) => {
                    emit(
                        self.events.as_ref(),
                        &record,
                        JobEventPayload::Assigned {
                            node_id: node.id.clone(),
                            dispatch_seq: record.dispatch_seq,
                        },
                    )
                    .await;
                    let node_id = node.id.clone();
                    self.spawn_attempt(record, node).await;
                    return Ok(Some(node_id));
                }
                Err(err) => {
                    let released = self.release(&node.id).await;
                    if let Some(updated) = released {
                        replace_node(nodes, updated);
                    }
                    if err.is_conflict() || err.is_not_found() {
                        debug!(job_id = %job.id, "lost claim race: {err}");
                        return Ok(None);
                    }
                    return Err(err);
                }
            }
        }
        Err(BatonError::NoAvailableNodes(job.id))
    }

    async fn spawn_attempt(&self, job: JobRecord, node: NodeRecord) {
        let abort = CancelSignal::new();
        self.running.lock().await.insert(
            job.id,
            RunningAttempt {
                dispatch_seq: job.dispatch_seq,
                abort: abort.clone(),
            },
        );

        let job_id = job.id;
        let seq = job.dispatch_seq;
        let node_id = node.id.clone();
        let class = job.payload.job_class().to_string();
        let (job_label, node_label, class_label) =
            (job_id.to_string(), node_id.to_string(), class.clone());

        let this = self.clone();
        let attempt = async move {
            if let Some(verdict) = this.drive_attempt(job, node, abort).await {
                let settlement = Settlement {
                    job_id,
                    dispatch_seq: seq,
                    node_id,
                    class,
                    verdict,
                };
                this.settle_with_retry(settlement).await;
            }
            let mut running = this.running.lock().await;
            if running.get(&job_id).is_some_and(|r| r.dispatch_seq == seq) {
                running.remove(&job_id);
            }
            drop(running);
            this.wake.notify_one();
        };
        tokio::spawn(telemetry::instrument_dispatch(
            job_label,
            node_label,
            class_label,
            attempt,
        ));
    }

    /// Runs one attempt and reports how it ended. `None` means the attempt
    /// was superseded before it started and has nothing to record.
    async fn drive_attempt(
        &self,
        job: JobRecord,
        node: NodeRecord,
        abort: CancelSignal,
    ) -> Option<Verdict> {
        let seq = job.dispatch_seq;

        match self.registry.try_get(&node.id).await {
            Ok(Some(current)) if current.status.is_lost() => {
                debug!(job_id = %job.id, "{}", BatonError::NodeUnreachable(node.id.clone()));
                return Some(Verdict::Requeue(RequeueReason::NodeUnreachable));
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    job_id = %job.id,
                    node_id = %node.id,
                    "node lookup failed before start: {err}"
                );
                return Some(Verdict::Requeue(RequeueReason::Interrupted));
            }
        }

        let started = self
            .store
            .update(job.id, |record| {
                ensure_current(record, seq, &[JobState::Assigned])?;
                record.start(Utc::now())
            })
            .await;
        let started = match started {
            Ok(record) => record,
            Err(err) if err.is_stale() || err.is_not_found() => {
                debug!(job_id = %job.id, "attempt superseded before start: {err}");
                return None;
            }
            Err(err) => {
                warn!(job_id = %job.id, "could not start attempt: {err}");
                return Some(Verdict::Requeue(RequeueReason::Interrupted));
            }
        };
        let attempt = started.attempt_count + 1;
        emit(
            self.events.as_ref(),
            &started,
            JobEventPayload::Started {
                node_id: node.id.clone(),
                attempt,
            },
        )
        .await;
        telemetry::record_job_dispatched(node.id.as_str(), started.payload.job_class());
        let timing = telemetry::record_job_start(job.id.to_string());

        let (reporter, mut progress) = ProgressReporter::channel(PROGRESS_BUFFER);
        let task = ExecutionTask {
            job_id: job.id,
            dispatch_seq: seq,
            attempt,
            payload: started.payload.clone(),
            node: node.clone(),
            deadline: started.deadline,
        };
        let execution = AssertUnwindSafe(self.executor.execute(task, reporter, abort.clone()))
            .catch_unwind()
            .map(|result| result.unwrap_or_else(|_| Err(anyhow::anyhow!("executor panicked"))));
        tokio::pin!(execution);

        let remaining = (started.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let deadline = tokio::time::sleep(remaining);
        tokio::pin!(deadline);

        let end = loop {
            tokio::select! {
                result = &mut execution => break AttemptEnd::Finished(result),
                Some(fraction) = progress.recv() => {
                    self.apply_progress(job.id, seq, fraction).await;
                }
                _ = &mut deadline => break AttemptEnd::DeadlineExceeded,
                _ = abort.cancelled() => break AttemptEnd::Aborted,
            }
        };

        let class = started.payload.job_class();
        let verdict = match end {
            AttemptEnd::Finished(Ok(ExecutionOutcome::Succeeded)) => {
                telemetry::record_job_end(timing, class, "succeeded");
                Verdict::Succeeded
            }
            AttemptEnd::Finished(Ok(ExecutionOutcome::Failed { message, retryable })) => {
                telemetry::record_job_end(timing, class, "failed");
                Verdict::Failed { message, retryable }
            }
            AttemptEnd::Finished(Err(err)) => {
                telemetry::record_job_end(timing, class, "failed");
                Verdict::Failed {
                    message: format!("{err:#}"),
                    retryable: true,
                }
            }
            AttemptEnd::DeadlineExceeded => {
                abort.cancel();
                let _ = tokio::time::timeout(ABORT_GRACE, &mut execution).await;
                telemetry::record_job_end(timing, class, "deadline_exceeded");
                Verdict::DeadlineExceeded
            }
            AttemptEnd::Aborted => {
                let _ = tokio::time::timeout(ABORT_GRACE, &mut execution).await;
                // Cancellation and node loss already moved the job on; only
                // a shutdown leaves it in flight under this attempt.
                Verdict::Requeue(RequeueReason::Shutdown)
            }
        };
        Some(verdict)
    }

    async fn apply_progress(&self, id: JobId, seq: u64, fraction: f64) {
        let now = Utc::now();
        let updated = self
            .store
            .update(id, |record| {
                ensure_current(record, seq, &[JobState::Running])?;
                record.set_progress(fraction, now)
            })
            .await;
        match updated {
            Ok(record) => {
                emit(
                    self.events.as_ref(),
                    &record,
                    JobEventPayload::Progress {
                        progress: record.progress,
                    },
                )
                .await;
            }
            Err(err) => debug!(job_id = %id, "progress dropped: {err}"),
        }
    }

    /// Records an attempt's outcome, retrying with backoff. An outcome that
    /// still cannot be written is parked for [`settle_pending`](Self::settle_pending).
    async fn settle_with_retry(&self, settlement: Settlement) {
        let mut delay = SETTLE_BACKOFF;
        for attempt in 1..=SETTLE_TRIES {
            match self.settle(&settlement, Utc::now()).await {
                Ok(_) => return,
                Err(err) => {
                    warn!(
                        job_id = %settlement.job_id,
                        attempt,
                        "recording attempt outcome failed: {err}"
                    );
                }
            }
            if attempt < SETTLE_TRIES {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        error!(
            job_id = %settlement.job_id,
            dispatch_seq = settlement.dispatch_seq,
            "attempt outcome unrecorded, retrying on the next health sweep"
        );
        self.unsettled.lock().await.push(settlement);
    }

    /// Writes `settlement` back to the job and releases its slot. Returns
    /// whether the write applied; `false` means the attempt was superseded.
    ///
    /// Only the state write can fail. Slot releases that fail are retried
    /// later; dependency follow-ups that fail are picked up by
    /// [`DependencyTracker::reevaluate_pending`].
    async fn settle(&self, settlement: &Settlement, now: DateTime<Utc>) -> Result<bool> {
        let Some(record) = self.commit(settlement, now).await? else {
            return Ok(false);
        };
        self.release(&settlement.node_id).await;
        self.announce(settlement, &record, now).await;

        let id = settlement.job_id;
        let follow_up = match &settlement.verdict {
            Verdict::Succeeded => {
                let promoted = self.tracker.on_succeeded(&record, now).await;
                if let Ok(promoted) = &promoted
                    && !promoted.is_empty()
                {
                    debug!(job_id = %id, promoted = promoted.len(), "dependents became eligible");
                    self.wake.notify_one();
                }
                promoted.map(|_| ())
            }
            Verdict::Failed { .. } | Verdict::DeadlineExceeded if record.is_terminal() => {
                self.tracker.on_terminal_failure(&record, now).await.map(|_| ())
            }
            _ => Ok(()),
        };
        if let Err(err) = follow_up {
            warn!(job_id = %id, "dependents not updated until the next health sweep: {err}");
        }
        Ok(true)
    }

    async fn commit(
        &self,
        settlement: &Settlement,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        let (id, seq) = (settlement.job_id, settlement.dispatch_seq);
        let node_id = Some(settlement.node_id.clone());
        let written = match &settlement.verdict {
            Verdict::Succeeded => {
                self.store
                    .update(id, |record| {
                        ensure_current(record, seq, &[JobState::Running])?;
                        record.succeed(now)
                    })
                    .await
            }
            Verdict::Failed { message, retryable } => {
                let error = JobError::new(JobErrorKind::ExecutorFailure, message.clone(), now)
                    .retryable(*retryable)
                    .on_node(node_id);
                self.store
                    .update(id, |record| {
                        ensure_current(record, seq, &[JobState::Running])?;
                        let decision = self.retry.decide(
                            record.attempt_count + 1,
                            record.max_attempts,
                            *retryable,
                            now,
                        );
                        record.record_failure(error.clone(), decision.retry_at(), now)
                    })
                    .await
            }
            Verdict::DeadlineExceeded => {
                let error = JobError::new(
                    JobErrorKind::DeadlineExceeded,
                    "job exceeded its timeout while running",
                    now,
                )
                .on_node(node_id);
                self.store
                    .update(id, |record| {
                        ensure_current(record, seq, &[JobState::Running])?;
                        record.fail_terminal(error.clone(), now)
                    })
                    .await
            }
            Verdict::Requeue(_) => {
                self.store
                    .update(id, |record| {
                        ensure_current(record, seq, &[JobState::Assigned, JobState::Running])?;
                        record.requeue(now)
                    })
                    .await
            }
        };

        match written {
            Ok(record) => Ok(Some(record)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) if err.is_stale() => match self.store.try_get(id).await? {
                // An earlier try applied but its acknowledgement was lost.
                Some(current) if settlement.landed_in(&current) => Ok(Some(current)),
                _ => {
                    debug!(job_id = %id, "stale outcome dropped: {err}");
                    Ok(None)
                }
            },
            Err(err) => Err(err),
        }
    }

    async fn announce(&self, settlement: &Settlement, record: &JobRecord, now: DateTime<Utc>) {
        let id = settlement.job_id;
        let node_id = &settlement.node_id;
        let class = settlement.class.as_str();
        match &settlement.verdict {
            Verdict::Succeeded => {
                self.balancer.record_outcome(node_id, class, true).await;
                telemetry::record_job_completed(class, "succeeded");
                emit(
                    self.events.as_ref(),
                    record,
                    JobEventPayload::Completed {
                        node_id: node_id.clone(),
                    },
                )
                .await;
            }
            Verdict::Failed { message, retryable } => {
                warn!(
                    "{}",
                    BatonError::ExecutorFailure {
                        job_id: id,
                        message: message.clone(),
                    }
                );
                self.balancer.record_outcome(node_id, class, false).await;
                let retry_at = record.retry_at;
                match retry_at {
                    Some(at) => {
                        telemetry::record_job_completed(class, "retrying");
                        info!(
                            job_id = %id,
                            attempt = record.attempt_count,
                            retry_at = %at,
                            "attempt failed, retry scheduled"
                        );
                    }
                    None => {
                        telemetry::record_job_completed(class, "failed");
                        warn!(
                            job_id = %id,
                            attempts = record.attempt_count,
                            retryable,
                            "job failed"
                        );
                    }
                }
                let error = record.error.clone().unwrap_or_else(|| {
                    JobError::new(JobErrorKind::ExecutorFailure, message.clone(), now)
                });
                emit(
                    self.events.as_ref(),
                    record,
                    JobEventPayload::Failed {
                        error,
                        will_retry: retry_at.is_some(),
                        retry_at,
                    },
                )
                .await;
            }
            Verdict::DeadlineExceeded => {
                telemetry::record_job_completed(class, "deadline_exceeded");
                warn!(job_id = %id, node_id = %node_id, "job deadline exceeded");
                let error = record.error.clone().unwrap_or_else(|| {
                    JobError::new(JobErrorKind::DeadlineExceeded, "job exceeded its timeout", now)
                });
                emit(
                    self.events.as_ref(),
                    record,
                    JobEventPayload::Failed {
                        error,
                        will_retry: false,
                        retry_at: None,
                    },
                )
                .await;
            }
            Verdict::Requeue(reason) => {
                telemetry::record_job_requeued(node_id.as_str(), reason.as_str());
                emit(
                    self.events.as_ref(),
                    record,
                    JobEventPayload::Requeued {
                        reason: *reason,
                        node_id: node_id.clone(),
                    },
                )
                .await;
                self.wake.notify_one();
            }
        }
    }

    /// Fails an ELIGIBLE job whose deadline passed before it was placed.
    async fn expire(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let error = JobError::new(
            JobErrorKind::DeadlineExceeded,
            "deadline passed before the job could be placed",
            now,
        );
        let updated = self
            .store
            .update_expecting(id, &[JobState::Eligible], |record| {
                if !record.is_past_deadline(now) {
                    return Err(BatonError::conflict(format!("job/{id}"), "deadline moved"));
                }
                record.fail_terminal(error.clone(), now)
            })
            .await;
        let record = match updated {
            Ok(record) => record,
            Err(err) if err.is_conflict() || err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        };

        warn!(job_id = %id, "job expired in queue");
        telemetry::record_job_completed(record.payload.job_class(), "deadline_exceeded");
        emit(
            self.events.as_ref(),
            &record,
            JobEventPayload::Failed {
                error,
                will_retry: false,
                retry_at: None,
            },
        )
        .await;
        self.tracker.on_terminal_failure(&record, now).await?;
        Ok(true)
    }

    /// Returns one attempt to the queue if it is still current. Releases
    /// its slot and reports whether the requeue applied.
    async fn requeue_attempt(
        &self,
        id: JobId,
        seq: u64,
        node_id: &NodeId,
        reason: RequeueReason,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let settlement = Settlement {
            job_id: id,
            dispatch_seq: seq,
            node_id: node_id.clone(),
            class: String::new(),
            verdict: Verdict::Requeue(reason),
        };
        self.settle(&settlement, now).await
    }

    /// Cancels a job that has not reached a terminal state. A running
    /// executor is signalled to abort; dependents are cancelled in turn.
    pub async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<JobRecord> {
        let error = JobError::new(JobErrorKind::Cancelled, "cancelled by request", now);
        let mut held_slot: Option<NodeId> = None;
        let record = self
            .store
            .update(id, |record| {
                if record.is_terminal() {
                    return Err(BatonError::conflict(
                        format!("job/{id}"),
                        format!("job already {}", record.state),
                    ));
                }
                held_slot = if record.state.is_active() {
                    record.assigned_node.clone()
                } else {
                    None
                };
                record.cancel(error.clone(), now)
            })
            .await?;

        if let Some(node_id) = &held_slot {
            self.release(node_id).await;
            if let Some(attempt) = self.running.lock().await.get(&id) {
                attempt.abort.cancel();
            }
        }
        info!(job_id = %id, "job cancelled");
        telemetry::record_job_cancelled("user");
        emit(
            self.events.as_ref(),
            &record,
            JobEventPayload::Cancelled { error },
        )
        .await;
        if let Err(err) = self.tracker.on_terminal_failure(&record, now).await {
            warn!(job_id = %id, "dependents not cancelled until the next health sweep: {err}");
        }
        Ok(record)
    }

    /// Requeues every in-flight job assigned to `node_id` without counting
    /// the attempt, then zeroes the node's load if it is still lost.
    pub async fn requeue_node(
        &self,
        node_id: &NodeId,
        reason: RequeueReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>> {
        let filter = JobFilter::in_state(JobState::Assigned)
            .with_state(JobState::Running)
            .on_node(node_id.clone());
        let mut requeued = Vec::new();
        for job in self.store.collect(filter).await? {
            if self
                .requeue_attempt(job.id, job.dispatch_seq, node_id, reason, now)
                .await?
            {
                let running = self.running.lock().await;
                if let Some(attempt) = running.get(&job.id)
                    && attempt.dispatch_seq == job.dispatch_seq
                {
                    attempt.abort.cancel();
                }
                requeued.push(job.id);
            }
        }

        match self.registry.reset_load(node_id).await {
            Ok(_) => self.owed_slots.lock().await.retain(|owed| owed != node_id),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        if !requeued.is_empty() {
            info!(
                node_id = %node_id,
                jobs = requeued.len(),
                reason = reason.as_str(),
                "requeued jobs from node"
            );
        }
        Ok(requeued)
    }

    /// Requeues jobs left ASSIGNED or RUNNING by a previous coordinator
    /// process. Only valid before any dispatch in this process.
    pub async fn recover_in_flight(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let filter = JobFilter::in_state(JobState::Assigned).with_state(JobState::Running);
        let mut recovered = Vec::new();
        for job in self.store.collect(filter).await? {
            let Some(node_id) = job.assigned_node.clone() else {
                continue;
            };
            if self
                .requeue_attempt(job.id, job.dispatch_seq, &node_id, RequeueReason::Recovered, now)
                .await?
            {
                recovered.push(job.id);
            }
        }
        if !recovered.is_empty() {
            info!(jobs = recovered.len(), "recovered in-flight jobs");
        }
        Ok(recovered)
    }

    /// Moves failed jobs whose backoff has elapsed back to ELIGIBLE.
    pub async fn promote_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut promoted = Vec::new();
        for job in self.store.collect(JobFilter::in_state(JobState::Failed)).await? {
            if !job.retry_at.is_some_and(|at| at <= now) {
                continue;
            }
            let updated = self
                .store
                .update_expecting(job.id, &[JobState::Failed], |record| {
                    if !record.retry_at.is_some_and(|at| at <= now) {
                        return Err(BatonError::conflict(
                            format!("job/{}", record.id),
                            "retry not due",
                        ));
                    }
                    record.promote_retry(now)
                })
                .await;
            match updated {
                Ok(record) => {
                    emit(self.events.as_ref(), &record, JobEventPayload::Eligible).await;
                    promoted.push(record.id);
                }
                Err(err) if err.is_conflict() || err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        if !promoted.is_empty() {
            debug!(jobs = promoted.len(), "retries promoted");
            self.wake.notify_one();
        }
        Ok(promoted)
    }

    /// Signals every live attempt to abort. Their tasks requeue the jobs.
    pub async fn abort_all(&self) {
        for attempt in self.running.lock().await.values() {
            attempt.abort.cancel();
        }
    }

    /// Waits until no attempt task is alive. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.in_flight().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Retries attempt outcomes and slot releases that could not be
    /// written when they happened. Returns the jobs whose outcome is now
    /// recorded, superseded ones included.
    pub async fn settle_pending(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let owed = std::mem::take(&mut *self.owed_slots.lock().await);
        for node_id in owed {
            self.release(&node_id).await;
        }

        let parked = std::mem::take(&mut *self.unsettled.lock().await);
        let mut settled = Vec::new();
        for settlement in parked {
            match self.settle(&settlement, now).await {
                Ok(_) => settled.push(settlement.job_id),
                Err(err) => {
                    warn!(job_id = %settlement.job_id, "attempt outcome still unrecorded: {err}");
                    self.unsettled.lock().await.push(settlement);
                }
            }
        }
        if !settled.is_empty() {
            info!(jobs = settled.len(), "recorded deferred attempt outcomes");
        }
        settled
    }

    /// Attempt outcomes and slot releases waiting for [`settle_pending`](Self::settle_pending).
    pub async fn unsettled(&self) -> usize {
        self.unsettled.lock().await.len() + self.owed_slots.lock().await.len()
    }

    /// Gives back one slot on `node_id`. A release that fails is kept and
    /// retried by [`settle_pending`](Self::settle_pending).
    async fn release(&self, node_id: &NodeId) -> Option<NodeRecord> {
        match self.registry.release_slot(node_id).await {
            Ok(node) => {
                self.wake.notify_one();
                Some(node)
            }
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                warn!(node_id = %node_id, "release slot failed, retrying on next sweep: {err}");
                self.owed_slots.lock().await.push(node_id.clone());
                None
            }
        }
    }
}

/// Rejects writes from an attempt that is no longer the job's current one.
fn ensure_current(record: &JobRecord, seq: u64, states: &[JobState]) -> Result<()> {
    if record.dispatch_seq != seq || !states.contains(&record.state) {
        return Err(BatonError::StaleAttempt {
            job_id: record.id,
            dispatch_seq: seq,
        });
    }
    Ok(())
}

fn replace_node(nodes: &mut [NodeRecord], updated: NodeRecord) {
    if let Some(slot) = nodes.iter_mut().find(|n| n.id == updated.id) {
        *slot = updated;
    }
}
