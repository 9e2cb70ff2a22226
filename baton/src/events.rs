use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{JobError, JobId, JobPriority, JobRecord, JobState};
use crate::node::NodeId;

/// Metadata envelope attached to every job event.
///
/// `event_seq` is copied from the job record as written by the same atomic
/// update that produced the event, so it is strictly increasing per job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub job_id: JobId,
    pub event_seq: u64,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn for_record(record: &JobRecord) -> Self {
        Self {
            version: 1,
            job_id: record.id,
            event_seq: record.event_seq,
            correlation_id: record.correlation_id,
            timestamp: record.updated_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(record: &JobRecord, payload: JobEventPayload) -> Self {
        Self {
            meta: EventMeta::for_record(record),
            payload,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.meta.job_id
    }

    pub fn event_seq(&self) -> u64 {
        self.meta.event_seq
    }

    /// Whether this event reports the job reaching a terminal state.
    pub fn is_terminal(&self) -> bool {
        match &self.payload {
            JobEventPayload::Completed { .. } | JobEventPayload::Cancelled { .. } => {
                true
            }
            JobEventPayload::Failed { will_retry, .. } => !will_retry,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeueReason {
    NodeUnreachable,
    NodeDeregistered,
    /// The coordinator shut down while the job was running.
    Shutdown,
    /// Found in flight when the coordinator started.
    Recovered,
    /// The attempt's own bookkeeping could not be written.
    Interrupted,
}

impl RequeueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequeueReason::NodeUnreachable => "node_unreachable",
            RequeueReason::NodeDeregistered => "node_deregistered",
            RequeueReason::Shutdown => "shutdown",
            RequeueReason::Recovered => "recovered",
            RequeueReason::Interrupted => "interrupted",
        }
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    Submitted {
        priority: JobPriority,
        state: JobState,
    },
    Eligible,
    Assigned {
        node_id: NodeId,
        dispatch_seq: u64,
    },
    Started {
        node_id: NodeId,
        attempt: u32,
    },
    Progress {
        progress: f64,
    },
    Completed {
        node_id: NodeId,
    },
    Failed {
        error: JobError,
        will_retry: bool,
        retry_at: Option<DateTime<Utc>>,
    },
    /// Returned to the queue after losing its node; attempts unchanged.
    Requeued {
        reason: RequeueReason,
        node_id: NodeId,
    },
    Cancelled {
        error: JobError,
    },
    /// Removed by the retention sweep.
    Purged,
}

impl JobEventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            JobEventPayload::Submitted { .. } => "submitted",
            JobEventPayload::Eligible => "eligible",
            JobEventPayload::Assigned { .. } => "assigned",
            JobEventPayload::Started { .. } => "started",
            JobEventPayload::Progress { .. } => "progress",
            JobEventPayload::Completed { .. } => "completed",
            JobEventPayload::Failed { .. } => "failed",
            JobEventPayload::Requeued { .. } => "requeued",
            JobEventPayload::Cancelled { .. } => "cancelled",
            JobEventPayload::Purged => "purged",
        }
    }
}

/// Trait for publishing job lifecycle events.
#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    /// Publish a job event.
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()>;
    /// Subscribe to job events.
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` and should
/// re-read job status from the store for anything it may have missed.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl JobEventPublisher for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

/// Publishes `payload` for `record`. Publish failures are logged; the state
/// change they describe has already been committed.
///
/// Publishing happens after the commit and is not ordered between writers,
/// so two events for one job can arrive out of `event_seq` order (a cancel
/// racing an attempt's progress report, say). Consumers order by
/// `event_seq`, not arrival.
pub(crate) async fn emit(
    events: &dyn JobEventPublisher,
    record: &JobRecord,
    payload: JobEventPayload,
) {
    let name = payload.name();
    if let Err(err) = events.publish(JobEvent::new(record, payload)).await {
        tracing::error!(job_id = %record.id, event = name, "publish event failed: {err}");
    }
}

/// Sequence numbers remembered exactly per job before older ones are
/// folded into a low-water mark.
const DEDUP_WINDOW: usize = 64;

/// Drops redelivered events by remembering which `event_seq` values were
/// seen per job.
///
/// Events can arrive out of order, so a late event with a lower sequence
/// number than one already seen is still delivered once. Only the most
/// recent 64 numbers are kept exactly; anything at or below
/// the oldest forgotten number is treated as seen.
#[derive(Debug, Default)]
pub struct EventDeduplicator {
    seen: HashMap<JobId, SeenSeqs>,
}

#[derive(Debug, Default)]
struct SeenSeqs {
    floor: Option<u64>,
    recent: BTreeSet<u64>,
}

impl SeenSeqs {
    fn insert(&mut self, seq: u64) -> bool {
        if self.floor.is_some_and(|floor| seq <= floor) || !self.recent.insert(seq) {
            return false;
        }
        while self.recent.len() > DEDUP_WINDOW {
            self.floor = self.recent.pop_first();
        }
        true
    }
}

impl EventDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time an event is observed.
    pub fn observe(&mut self, event: &JobEvent) -> bool {
        self.seen
            .entry(event.job_id())
            .or_default()
            .insert(event.event_seq())
    }

    /// Forgets a job once its stream is finished.
    pub fn forget(&mut self, job_id: &JobId) {
        self.seen.remove(job_id);
    }

    pub fn tracked_jobs(&self) -> usize {
        self.seen.len()
    }
}
