//! Dependency Graph Tracker.
//!
//! Eligibility is derived from the store on demand: a pending job becomes
//! eligible once every dependency exists and has SUCCEEDED. Dependents are
//! tracked as reverse edges on each record so that completions and
//! failures only touch their direct neighbours.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{BatonError, Result};
use crate::events::{JobEventPayload, JobEventPublisher, emit};
use crate::job::{JobError, JobErrorKind, JobFilter, JobId, JobRecord, JobState};
use crate::store::JobStore;
use crate::telemetry;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Evaluation {
    /// Moved PENDING -> ELIGIBLE.
    Promoted,
    /// At least one dependency is still in flight.
    Waiting,
    /// A dependency failed; this job and `cascade` dependents were cancelled.
    Cancelled { cascade: usize },
    /// The job was not pending (already promoted, cancelled, ...).
    Unchanged,
}

#[derive(Clone)]
pub struct DependencyTracker {
    store: JobStore,
    events: Arc<dyn JobEventPublisher>,
}

impl DependencyTracker {
    pub fn new(store: JobStore, events: Arc<dyn JobEventPublisher>) -> Self {
        Self { store, events }
    }

    /// Checks a batch of new jobs before anything is written: ids must be
    /// fresh and unique, every dependency must exist in the batch or the
    /// store, and the batch must not introduce a cycle.
    pub async fn validate(&self, batch: &[(JobId, BTreeSet<JobId>)]) -> Result<()> {
        let mut graph: BTreeMap<JobId, BTreeSet<JobId>> = BTreeMap::new();
        for (id, dependencies) in batch {
            if graph.insert(*id, dependencies.clone()).is_some() {
                return Err(BatonError::InvalidSubmission(format!(
                    "duplicate job id {id} in batch"
                )));
            }
        }

        for (id, dependencies) in batch {
            if self.store.try_get(*id).await?.is_some() {
                return Err(BatonError::InvalidSubmission(format!(
                    "job id {id} already exists"
                )));
            }
            for dependency in dependencies {
                if graph.contains_key(dependency) {
                    continue;
                }
                if self.store.try_get(*dependency).await?.is_none() {
                    return Err(BatonError::InvalidDependencyGraph(format!(
                        "job {id} depends on unknown job {dependency}"
                    )));
                }
            }
        }

        // Existing jobs cannot depend on ids that do not exist yet, so any
        // cycle must lie entirely inside the batch.
        if let Some(cycle) = find_cycle(&graph) {
            let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            return Err(BatonError::InvalidDependencyGraph(format!(
                "cycle: {}",
                path.join(" -> ")
            )));
        }
        Ok(())
    }

    /// Writes validated PENDING records, links them into their dependencies'
    /// dependent sets, then evaluates each one.
    ///
    /// If a record cannot be written (an id taken since validation, say),
    /// the records already written for this batch are removed again before
    /// the error is returned.
    pub async fn register(
        &self,
        records: Vec<JobRecord>,
        now: DateTime<Utc>,
    ) -> Result<Vec<(JobId, Evaluation)>> {
        for (written, record) in records.iter().enumerate() {
            if let Err(err) = self.store.insert(record).await {
                self.roll_back(&records[..written], now).await;
                return Err(err);
            }
        }

        for record in &records {
            emit(
                self.events.as_ref(),
                record,
                JobEventPayload::Submitted {
                    priority: record.priority,
                    state: record.state,
                },
            )
            .await;
            for dependency in &record.dependencies {
                let child = record.id;
                let linked = self
                    .store
                    .update(*dependency, |parent| {
                        parent.dependents.insert(child);
                        Ok(())
                    })
                    .await;
                match linked {
                    Ok(_) => {}
                    // Evaluation treats the missing dependency as failed.
                    Err(err) if err.is_not_found() => {
                        debug!(job_id = %child, %dependency, "dependency vanished before linking");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let mut outcomes = Vec::with_capacity(records.len());
        for record in &records {
            outcomes.push((record.id, self.evaluate(record.id, now).await?));
        }
        Ok(outcomes)
    }

    /// Removes records written by a batch that was then rejected. A record
    /// that cannot be removed is cancelled so it never waits forever.
    async fn roll_back(&self, written: &[JobRecord], now: DateTime<Utc>) {
        for record in written {
            match self.store.remove_if(record.id, |current| current == record).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => warn!(job_id = %record.id, "rollback delete failed: {err}"),
            }
            let error = JobError::new(
                JobErrorKind::Cancelled,
                "submission batch was rejected",
                now,
            );
            match self
                .store
                .update_expecting(record.id, &[JobState::Pending], |job| {
                    job.cancel(error.clone(), now)
                })
                .await
            {
                Ok(_) => warn!(job_id = %record.id, "rejected batch member cancelled"),
                Err(err) if err.is_conflict() || err.is_not_found() => {}
                Err(err) => {
                    warn!(job_id = %record.id, "rejected batch member left pending: {err}");
                }
            }
        }
    }

    pub async fn evaluate(&self, id: JobId, now: DateTime<Utc>) -> Result<Evaluation> {
        let record = self.store.get(id).await?;
        if record.state != JobState::Pending {
            return Ok(Evaluation::Unchanged);
        }

        let mut waiting = false;
        for dependency in &record.dependencies {
            match self.store.try_get(*dependency).await? {
                Some(dep) if dep.state == JobState::Succeeded => {}
                Some(dep) if dep.is_terminal() => {
                    return self.cancel_for_dependency(id, dep.id, now).await;
                }
                Some(_) => waiting = true,
                None => {
                    return self.cancel_for_dependency(id, *dependency, now).await;
                }
            }
        }
        if waiting {
            return Ok(Evaluation::Waiting);
        }

        match self
            .store
            .update_expecting(id, &[JobState::Pending], |job| job.mark_eligible(now))
            .await
        {
            Ok(promoted) => {
                debug!(job_id = %id, "job eligible");
                emit(self.events.as_ref(), &promoted, JobEventPayload::Eligible).await;
                Ok(Evaluation::Promoted)
            }
            Err(err) if err.is_conflict() => Ok(Evaluation::Unchanged),
            Err(err) => Err(err),
        }
    }

    /// Evaluates every PENDING job. Picks up promotions and cascades whose
    /// follow-up was lost to a store error. Returns the jobs that changed.
    pub async fn reevaluate_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(JobId, Evaluation)>> {
        let mut changed = Vec::new();
        for job in self.store.collect(JobFilter::in_state(JobState::Pending)).await? {
            match self.evaluate(job.id, now).await {
                Ok(outcome @ (Evaluation::Promoted | Evaluation::Cancelled { .. })) => {
                    changed.push((job.id, outcome));
                }
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        if !changed.is_empty() {
            info!(jobs = changed.len(), "pending jobs resolved on re-evaluation");
        }
        Ok(changed)
    }

    /// Re-evaluates the direct dependents of a job that just SUCCEEDED.
    /// Returns the ids that became eligible.
    pub async fn on_succeeded(
        &self,
        job: &JobRecord,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>> {
        let mut promoted = Vec::new();
        for dependent in &job.dependents {
            match self.evaluate(*dependent, now).await {
                Ok(Evaluation::Promoted) => promoted.push(*dependent),
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(promoted)
    }

    /// Cancels every transitive dependent of a job that reached FAILED or
    /// CANCELLED terminally. Returns the cancelled ids.
    pub async fn on_terminal_failure(
        &self,
        job: &JobRecord,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>> {
        let start = job.dependents.iter().map(|dependent| (*dependent, job.id));
        self.cascade(start.collect(), now).await
    }

    async fn cancel_for_dependency(
        &self,
        id: JobId,
        dependency: JobId,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let cancelled = self.cascade(VecDeque::from([(id, dependency)]), now).await?;
        match cancelled.len() {
            0 => Ok(Evaluation::Unchanged),
            n => Ok(Evaluation::Cancelled { cascade: n - 1 }),
        }
    }

    async fn cascade(
        &self,
        mut queue: VecDeque<(JobId, JobId)>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>> {
        let mut cancelled = Vec::new();
        while let Some((id, failed_dependency)) = queue.pop_front() {
            let reason = BatonError::DependencyFailed {
                job_id: id,
                dependency: failed_dependency,
            };
            let error =
                JobError::new(JobErrorKind::DependencyFailed, reason.to_string(), now);

            let outcome = self
                .store
                .update_expecting(id, &[JobState::Pending], |job| {
                    job.cancel(error.clone(), now)
                })
                .await;
            match outcome {
                Ok(record) => {
                    info!(
                        job_id = %id,
                        dependency = %failed_dependency,
                        "job cancelled by dependency failure"
                    );
                    telemetry::record_job_cancelled("dependency_failed");
                    emit(
                        self.events.as_ref(),
                        &record,
                        JobEventPayload::Cancelled { error },
                    )
                    .await;
                    queue.extend(record.dependents.iter().map(|dependent| (*dependent, id)));
                    cancelled.push(id);
                }
                Err(err) if err.is_conflict() || err.is_not_found() => {
                    debug!(job_id = %id, "skipping cascade: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(cancelled)
    }
}

/// Finds a cycle in `graph` (job -> dependencies), returned as the path
/// that closes it. Edges to ids outside the graph are ignored.
pub fn find_cycle(graph: &BTreeMap<JobId, BTreeSet<JobId>>) -> Option<Vec<JobId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: BTreeMap<JobId, Mark> = BTreeMap::new();
    for root in graph.keys() {
        if marks.contains_key(root) {
            continue;
        }
        // Iterative DFS; each frame is a node and its remaining edges.
        let mut path: Vec<JobId> = vec![*root];
        let mut stack: Vec<Vec<JobId>> =
            vec![graph[root].iter().copied().collect()];
        marks.insert(*root, Mark::Visiting);

        while let Some(edges) = stack.last_mut() {
            match edges.pop() {
                Some(next) if !graph.contains_key(&next) => {}
                Some(next) => match marks.get(&next) {
                    Some(Mark::Visiting) => {
                        let start = path.iter().position(|id| *id == next)?;
                        let mut cycle = path[start..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::Visiting);
                        path.push(next);
                        stack.push(graph[&next].iter().copied().collect());
                    }
                },
                None => {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        marks.insert(done, Mark::Done);
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcEventBus;
    use crate::job::{JobPayload, JobSubmission};
    use crate::persistence::InMemoryKvStore;

    fn tracker() -> (DependencyTracker, JobStore) {
        let store = JobStore::new(Arc::new(InMemoryKvStore::new()), 16);
        let tracker = DependencyTracker::new(store.clone(), Arc::new(InProcEventBus::new(64)));
        (tracker, store)
    }

    fn pending(id: JobId, deps: &[JobId]) -> JobRecord {
        let mut submission = JobSubmission::new(JobPayload::new("in.mov"));
        submission.dependencies = deps.to_vec();
        JobRecord::new(id, submission, 3, 600, 0, Utc::now())
    }

    fn graph(edges: &[(JobId, &[JobId])]) -> BTreeMap<JobId, BTreeSet<JobId>> {
        edges
            .iter()
            .map(|(id, deps)| (*id, deps.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn test_find_cycle() {
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());
        assert!(find_cycle(&graph(&[(a, &[]), (b, &[a]), (c, &[a, b])])).is_none());

        let cycle = find_cycle(&graph(&[(a, &[c]), (b, &[a]), (c, &[b])])).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);

        assert_eq!(find_cycle(&graph(&[(a, &[a])])), Some(vec![a, a]));
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_batches() {
        let (tracker, store) = tracker();
        let (a, b) = (JobId::new(), JobId::new());

        let missing = tracker
            .validate(&[(a, BTreeSet::from([JobId::new()]))])
            .await
            .unwrap_err();
        assert!(matches!(missing, BatonError::InvalidDependencyGraph(_)));

        let cyclic = tracker
            .validate(&[(a, BTreeSet::from([b])), (b, BTreeSet::from([a]))])
            .await
            .unwrap_err();
        assert!(matches!(cyclic, BatonError::InvalidDependencyGraph(_)));

        let duplicate = tracker
            .validate(&[(a, BTreeSet::new()), (a, BTreeSet::new())])
            .await
            .unwrap_err();
        assert!(matches!(duplicate, BatonError::InvalidSubmission(_)));

        store.insert(&pending(a, &[])).await.unwrap();
        tracker.validate(&[(b, BTreeSet::from([a]))]).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_promotes_roots_and_waits_on_children() {
        let (tracker, store) = tracker();
        let (a, b) = (JobId::new(), JobId::new());
        let outcomes = tracker
            .register(vec![pending(a, &[]), pending(b, &[a])], Utc::now())
            .await
            .unwrap();

        assert_eq!(outcomes, vec![(a, Evaluation::Promoted), (b, Evaluation::Waiting)]);
        assert_eq!(store.get(a).await.unwrap().dependents, BTreeSet::from([b]));
        assert_eq!(store.get(b).await.unwrap().state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_register_removes_partial_batch_when_an_id_is_taken() {
        let (tracker, store) = tracker();
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());
        let batch = vec![pending(a, &[]), pending(b, &[a]), pending(c, &[])];
        let edges: Vec<_> = batch
            .iter()
            .map(|job| (job.id, job.dependencies.clone()))
            .collect();
        tracker.validate(&edges).await.unwrap();

        // Another submission claims `b` after validation passed.
        let rival = pending(b, &[]);
        store.insert(&rival).await.unwrap();

        let err = tracker.register(batch, Utc::now()).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.try_get(a).await.unwrap().is_none());
        assert!(store.try_get(c).await.unwrap().is_none());
        assert_eq!(store.get(b).await.unwrap(), rival);
    }

    #[tokio::test]
    async fn test_reevaluate_pending_recovers_lost_follow_ups() {
        let (tracker, store) = tracker();
        let (a, b, c, d) = (JobId::new(), JobId::new(), JobId::new(), JobId::new());
        let now = Utc::now();
        tracker
            .register(
                vec![pending(a, &[]), pending(b, &[a]), pending(c, &[]), pending(d, &[c])],
                now,
            )
            .await
            .unwrap();

        // Finish `a` and cancel `c` without running their follow-ups.
        store
            .update(a, |job| {
                job.assign(crate::node::NodeId::new("n1"), now)?;
                job.start(now)?;
                job.succeed(now)
            })
            .await
            .unwrap();
        store
            .update(c, |job| {
                job.cancel(JobError::new(JobErrorKind::Cancelled, "user", now), now)
            })
            .await
            .unwrap();

        let mut changed = tracker.reevaluate_pending(now).await.unwrap();
        changed.sort_by_key(|(id, _)| *id);
        let mut expected = vec![
            (b, Evaluation::Promoted),
            (d, Evaluation::Cancelled { cascade: 0 }),
        ];
        expected.sort_by_key(|(id, _)| *id);
        assert_eq!(changed, expected);
        assert_eq!(store.get(b).await.unwrap().state, JobState::Eligible);
        assert_eq!(store.get(d).await.unwrap().state, JobState::Cancelled);
        assert!(tracker.reevaluate_pending(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_promotes_dependents() {
        let (tracker, store) = tracker();
        let (a, b) = (JobId::new(), JobId::new());
        let now = Utc::now();
        tracker
            .register(vec![pending(a, &[]), pending(b, &[a])], now)
            .await
            .unwrap();

        // Drive `a` to SUCCEEDED directly through the store.
        let done = store
            .update(a, |job| {
                job.assign(crate::node::NodeId::new("n1"), now)?;
                job.start(now)?;
                job.succeed(now)
            })
            .await
            .unwrap();

        let promoted = tracker.on_succeeded(&done, now).await.unwrap();
        assert_eq!(promoted, vec![b]);
        assert_eq!(store.get(b).await.unwrap().state, JobState::Eligible);
    }

    #[tokio::test]
    async fn test_failure_cascades_transitively() {
        let (tracker, store) = tracker();
        let (a, b, c, d) = (JobId::new(), JobId::new(), JobId::new(), JobId::new());
        let now = Utc::now();
        tracker
            .register(
                vec![
                    pending(a, &[]),
                    pending(b, &[a]),
                    pending(c, &[b]),
                    pending(d, &[]),
                ],
                now,
            )
            .await
            .unwrap();

        let cancelled_root = store
            .update(a, |job| {
                job.cancel(JobError::new(JobErrorKind::Cancelled, "user", now), now)
            })
            .await
            .unwrap();
        let cancelled = tracker.on_terminal_failure(&cancelled_root, now).await.unwrap();
        assert_eq!(cancelled, vec![b, c]);

        for id in [b, c] {
            let job = store.get(id).await.unwrap();
            assert_eq!(job.state, JobState::Cancelled);
            assert_eq!(
                job.error.map(|e| e.kind),
                Some(JobErrorKind::DependencyFailed)
            );
            assert!(job.started_at.is_none());
        }
        assert_eq!(store.get(d).await.unwrap().state, JobState::Eligible);
    }

    #[tokio::test]
    async fn test_dependency_on_already_failed_job_cancels_at_submission() {
        let (tracker, store) = tracker();
        let (a, b) = (JobId::new(), JobId::new());
        let now = Utc::now();
        tracker.register(vec![pending(a, &[])], now).await.unwrap();
        store
            .update(a, |job| {
                job.cancel(JobError::new(JobErrorKind::Cancelled, "user", now), now)
            })
            .await
            .unwrap();

        let outcomes = tracker.register(vec![pending(b, &[a])], now).await.unwrap();
        assert_eq!(outcomes, vec![(b, Evaluation::Cancelled { cascade: 0 })]);
    }
}
