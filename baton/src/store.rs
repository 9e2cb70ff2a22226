//! Job Record Store: the single source of truth for job state.
//!
//! Every write goes through [`JobStore::update`], an optimistic
//! read-modify-write on one key. Updates to the same job serialize through
//! the backend's compare-and-set; updates to different jobs never touch the
//! same key and proceed independently.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{BatonError, Result};
use crate::job::{JobFilter, JobId, JobRecord, JobState};
use crate::persistence::{self, KeyValueStore};

pub(crate) const JOB_PREFIX: &str = "job/";

fn job_key(id: JobId) -> String {
    format!("{JOB_PREFIX}{id}")
}

#[derive(Clone)]
pub struct JobStore {
    kv: Arc<dyn KeyValueStore>,
    page_size: usize,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl JobStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, page_size: usize) -> Self {
        Self {
            kv,
            page_size: page_size.max(1),
        }
    }

    /// Stores a new job. Fails with `Conflict` if the id is taken.
    pub async fn insert(&self, record: &JobRecord) -> Result<()> {
        persistence::insert_new(self.kv.as_ref(), &job_key(record.id), record)
            .await?;
        Ok(())
    }

    /// Unconditionally writes `record`, creating or replacing it.
    pub async fn put(&self, record: &JobRecord) -> Result<()> {
        let key = job_key(record.id);
        let value = persistence::encode(record)?;
        loop {
            let expected = self.kv.get(&key).await?.map(|entry| entry.version);
            let outcome = self
                .kv
                .compare_and_set(&key, expected, value.clone())
                .await?;
            if outcome.is_applied() {
                return Ok(());
            }
            trace!(job_id = %record.id, "put raced, retrying");
        }
    }

    pub async fn get(&self, id: JobId) -> Result<JobRecord> {
        self.try_get(id)
            .await?
            .ok_or_else(|| BatonError::job_not_found(id))
    }

    pub async fn try_get(&self, id: JobId) -> Result<Option<JobRecord>> {
        match self.kv.get(&job_key(id)).await? {
            Some(entry) => Ok(Some(persistence::decode(entry.value)?)),
            None => Ok(None),
        }
    }

    /// Atomic read-modify-write of one job. Returns the record as written.
    pub async fn update<F>(&self, id: JobId, mutate: F) -> Result<JobRecord>
    where
        F: FnMut(&mut JobRecord) -> Result<()> + Send,
    {
        match persistence::read_modify_write(self.kv.as_ref(), &job_key(id), mutate)
            .await
        {
            Ok((record, _)) => Ok(record),
            Err(BatonError::NotFound { entity: "key", .. }) => {
                Err(BatonError::job_not_found(id))
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`update`](Self::update), but fails with `Conflict` unless the
    /// job is in one of `expected` when the mutation is applied.
    pub async fn update_expecting<F>(
        &self,
        id: JobId,
        expected: &[JobState],
        mut mutate: F,
    ) -> Result<JobRecord>
    where
        F: FnMut(&mut JobRecord) -> Result<()> + Send,
    {
        self.update(id, |record| {
            if !expected.contains(&record.state) {
                return Err(BatonError::conflict(
                    job_key(id),
                    format!("expected one of {expected:?}, found {}", record.state),
                ));
            }
            mutate(record)
        })
        .await
    }

    /// Deletes the job if `predicate` holds on the current version.
    /// Returns `false` if the predicate failed or the job changed meanwhile.
    pub async fn remove_if<P>(&self, id: JobId, predicate: P) -> Result<bool>
    where
        P: Fn(&JobRecord) -> bool + Send,
    {
        let key = job_key(id);
        let Some(entry) = self.kv.get(&key).await? else {
            return Ok(false);
        };
        let record: JobRecord = persistence::decode(entry.value)?;
        if !predicate(&record) {
            return Ok(false);
        }
        Ok(self.kv.delete(&key, entry.version).await?)
    }

    /// Lazy, restartable scan over jobs matching `filter`.
    pub fn list(&self, filter: JobFilter) -> JobCursor {
        self.list_from(filter, JobCheckpoint::default())
    }

    pub fn list_from(&self, filter: JobFilter, checkpoint: JobCheckpoint) -> JobCursor {
        JobCursor {
            store: self.clone(),
            filter,
            fetched_through: checkpoint.after.clone(),
            last_returned: checkpoint.after,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn collect(&self, filter: JobFilter) -> Result<Vec<JobRecord>> {
        self.list(filter).collect().await
    }
}

/// Resume point for a [`JobCursor`]; serializable so a caller can page
/// across requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCheckpoint {
    after: Option<String>,
}

pub struct JobCursor {
    store: JobStore,
    filter: JobFilter,
    fetched_through: Option<String>,
    last_returned: Option<String>,
    buffer: VecDeque<(String, JobRecord)>,
    exhausted: bool,
}

impl JobCursor {
    pub async fn next(&mut self) -> Result<Option<JobRecord>> {
        loop {
            if let Some((key, record)) = self.buffer.pop_front() {
                self.last_returned = Some(key);
                return Ok(Some(record));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let page_size = self.store.page_size;
        let page = self
            .store
            .kv
            .scan_prefix(JOB_PREFIX, self.fetched_through.as_deref(), page_size)
            .await?;
        if page.len() < page_size {
            self.exhausted = true;
        }
        for (key, entry) in page {
            let record: JobRecord = persistence::decode(entry.value)?;
            self.fetched_through = Some(key.clone());
            if self.filter.matches(&record) {
                self.buffer.push_back((key, record));
            }
        }
        Ok(())
    }

    /// Position after the last record returned by [`next`](Self::next).
    pub fn checkpoint(&self) -> JobCheckpoint {
        JobCheckpoint {
            after: self.last_returned.clone(),
        }
    }

    pub async fn collect(mut self) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }
}
