use std::cmp::Ordering;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::{JobFilter, JobRecord, JobState};
use crate::store::JobStore;

/// Dispatch order among ELIGIBLE jobs: highest priority first, then
/// earliest creation, then submission sequence, then id.
pub fn dispatch_order(a: &JobRecord, b: &JobRecord) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.submit_seq.cmp(&b.submit_seq))
        .then_with(|| a.id.cmp(&b.id))
}

/// Trait for choosing which eligible jobs to dispatch next.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Up to `limit` ELIGIBLE jobs, best candidate first.
    async fn select(&self, limit: usize) -> Result<Vec<JobRecord>>;
}

/// Strict-priority scheduler with FIFO order inside each priority band.
///
/// Selection reads the store and never claims anything itself; the
/// dispatcher's ELIGIBLE -> ASSIGNED compare-and-set is what guarantees
/// at-most-one dispatch when several passes race.
#[derive(Clone, Debug)]
pub struct PriorityScheduler {
    store: JobStore,
}

impl PriorityScheduler {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    /// All eligible jobs in dispatch order.
    pub async fn eligible_queue(&self) -> Result<Vec<JobRecord>> {
        let mut eligible = self
            .store
            .collect(JobFilter::in_state(JobState::Eligible))
            .await?;
        eligible.sort_by(dispatch_order);
        Ok(eligible)
    }
}

#[async_trait]
impl Scheduler for PriorityScheduler {
    async fn select(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let mut queue = self.eligible_queue().await?;
        queue.truncate(limit);
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobPayload, JobPriority, JobSubmission};
    use crate::persistence::InMemoryKvStore;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn eligible(
        priority: JobPriority,
        created_offset_secs: i64,
        seq: u64,
    ) -> JobRecord {
        let now = Utc::now() + Duration::seconds(created_offset_secs);
        let submission =
            JobSubmission::new(JobPayload::new("in.mov")).with_priority(priority);
        let mut record = JobRecord::new(JobId::new(), submission, 3, 600, seq, now);
        record.mark_eligible(now).unwrap();
        record
    }

    #[test]
    fn test_higher_priority_wins_over_age() {
        let older_normal = eligible(JobPriority::Normal, 0, 1);
        let newer_high = eligible(JobPriority::High, 10, 2);
        assert_eq!(dispatch_order(&newer_high, &older_normal), Ordering::Less);
    }

    #[test]
    fn test_fifo_within_band() {
        let first = eligible(JobPriority::Normal, 0, 1);
        let second = eligible(JobPriority::Normal, 5, 2);
        assert_eq!(dispatch_order(&first, &second), Ordering::Less);

        let mut same_tick = eligible(JobPriority::Normal, 0, 3);
        same_tick.created_at = first.created_at;
        assert_eq!(dispatch_order(&first, &same_tick), Ordering::Less);
    }

    #[tokio::test]
    async fn test_select_skips_non_eligible_and_orders() {
        let store = JobStore::new(Arc::new(InMemoryKvStore::new()), 4);
        let low = eligible(JobPriority::Low, 0, 1);
        let critical = eligible(JobPriority::Critical, 3, 2);
        let normal = eligible(JobPriority::Normal, 1, 3);
        let pending = JobRecord::new(
            JobId::new(),
            JobSubmission::new(JobPayload::new("x")).with_priority(JobPriority::Critical),
            3,
            600,
            4,
            Utc::now(),
        );
        for job in [&low, &critical, &normal, &pending] {
            store.insert(job).await.unwrap();
        }

        let scheduler = PriorityScheduler::new(store);
        let ids: Vec<_> = scheduler
            .select(10)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(ids, vec![critical.id, normal.id, low.id]);

        assert_eq!(scheduler.select(1).await.unwrap()[0].id, critical.id);
    }
}
