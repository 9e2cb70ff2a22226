use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::job::{JobFilter, JobPriority, JobState};
use crate::node::{NodeRecord, NodeStatus};
use crate::registry::NodeRegistry;
use crate::store::JobStore;
use crate::telemetry;

/// Eligible jobs per unit of active capacity.
///
/// Zero capacity with work waiting is infinite pressure; an empty queue is
/// always zero.
pub fn pressure(eligible: usize, capacity: u64) -> f64 {
    match (eligible, capacity) {
        (0, _) => 0.0,
        (_, 0) => f64::INFINITY,
        (eligible, capacity) => eligible as f64 / capacity as f64,
    }
}

/// Snapshot of queue and cluster state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Timestamp when the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    pub jobs_by_state: BTreeMap<JobState, usize>,
    /// Eligible jobs only.
    pub eligible_by_priority: BTreeMap<JobPriority, usize>,
    pub nodes: NodeSummary,
}

/// Aggregate node counts inside a [`QueueSnapshot`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeSummary {
    pub active: usize,
    pub draining: usize,
    pub unreachable: usize,
    pub retired: usize,
    /// Sum of slots on ACTIVE nodes.
    pub capacity: u64,
    /// Slots in use on ACTIVE nodes.
    pub in_use: u64,
}

impl NodeSummary {
    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a NodeRecord>) -> Self {
        let mut summary = Self::default();
        for node in nodes {
            match node.status {
                NodeStatus::Active => {
                    summary.active += 1;
                    summary.capacity += u64::from(node.capacity);
                    summary.in_use += u64::from(node.active_job_count.min(node.capacity));
                }
                NodeStatus::Draining => summary.draining += 1,
                NodeStatus::Unreachable => summary.unreachable += 1,
                NodeStatus::Retired => summary.retired += 1,
            }
        }
        summary
    }

    /// Nodes still counted as part of the pool.
    pub fn live(&self) -> usize {
        self.active + self.draining
    }

    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.in_use)
    }
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            jobs_by_state: BTreeMap::new(),
            eligible_by_priority: BTreeMap::new(),
            nodes: NodeSummary::default(),
        }
    }

    /// Scans the job store and node registry. Also refreshes the queue
    /// depth and pressure gauges.
    pub async fn capture(
        store: &JobStore,
        registry: &NodeRegistry,
        sampled_at: DateTime<Utc>,
    ) -> Result<Self> {
        let mut snapshot = Self::new(sampled_at);
        let mut cursor = store.list(JobFilter::all());
        while let Some(job) = cursor.next().await? {
            *snapshot.jobs_by_state.entry(job.state).or_default() += 1;
            if job.state == JobState::Eligible {
                *snapshot.eligible_by_priority.entry(job.priority).or_default() += 1;
            }
        }
        snapshot.nodes = NodeSummary::from_nodes(&registry.list().await?);

        for priority in JobPriority::ALL {
            telemetry::set_queue_depth(priority.as_str(), snapshot.eligible_with(priority));
        }
        telemetry::set_cluster_pressure(snapshot.pressure());
        Ok(snapshot)
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs_by_state.get(&state).copied().unwrap_or(0)
    }

    pub fn eligible_with(&self, priority: JobPriority) -> usize {
        self.eligible_by_priority.get(&priority).copied().unwrap_or(0)
    }

    pub fn eligible(&self) -> usize {
        self.count(JobState::Eligible)
    }

    pub fn pressure(&self) -> f64 {
        pressure(self.eligible(), self.nodes.capacity)
    }

    pub fn total_jobs(&self) -> usize {
        self.jobs_by_state.values().sum()
    }
}
