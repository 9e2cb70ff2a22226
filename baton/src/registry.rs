//! Node Registry and health model.
//!
//! The registry owns node status writes. `active_job_count` lives on the
//! same record but is only changed through [`NodeRegistry::acquire_slot`]
//! and [`NodeRegistry::release_slot`], which the dispatcher drives.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{BatonError, Result};
use crate::node::{LoadSnapshot, NodeId, NodeRecord, NodeRegistration, NodeStatus};
use crate::persistence::{self, CasOutcome, KeyValueStore};

pub(crate) const NODE_PREFIX: &str = "node/";

fn node_key(id: &NodeId) -> String {
    format!("{NODE_PREFIX}{id}")
}

#[derive(Clone)]
pub struct NodeRegistry {
    kv: Arc<dyn KeyValueStore>,
    page_size: usize,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry").finish_non_exhaustive()
    }
}

impl NodeRegistry {
    pub fn new(kv: Arc<dyn KeyValueStore>, page_size: usize) -> Self {
        Self {
            kv,
            page_size: page_size.max(1),
        }
    }

    /// Registers a node as ACTIVE with zero load.
    ///
    /// A retired node id may register again; any other existing id is a
    /// `Conflict`.
    pub async fn register(
        &self,
        registration: NodeRegistration,
        now: DateTime<Utc>,
    ) -> Result<NodeRecord> {
        if registration.capacity == 0 {
            return Err(BatonError::InvalidSubmission(format!(
                "node {} registered with zero capacity",
                registration.id
            )));
        }
        let key = node_key(&registration.id);
        let record = NodeRecord::from_registration(registration, now);
        let value = persistence::encode(&record)?;

        let expected = match self.kv.get(&key).await? {
            None => None,
            Some(entry) => {
                let existing: NodeRecord = persistence::decode(entry.value)?;
                if existing.status != NodeStatus::Retired {
                    return Err(BatonError::conflict(key, "node already registered"));
                }
                Some(entry.version)
            }
        };
        match self.kv.compare_and_set(&key, expected, value).await? {
            CasOutcome::Applied { .. } => {
                info!(node_id = %record.id, capacity = record.capacity, "node registered");
                Ok(record)
            }
            CasOutcome::Mismatch { .. } => {
                Err(BatonError::conflict(key, "concurrent registration"))
            }
        }
    }

    async fn update<F>(&self, id: &NodeId, mutate: F) -> Result<NodeRecord>
    where
        F: FnMut(&mut NodeRecord) -> Result<()> + Send,
    {
        match persistence::read_modify_write(self.kv.as_ref(), &node_key(id), mutate)
            .await
        {
            Ok((record, _)) => Ok(record),
            Err(BatonError::NotFound { entity: "key", .. }) => {
                Err(BatonError::node_not_found(id))
            }
            Err(err) => Err(err),
        }
    }

    /// Records a liveness signal. An UNREACHABLE node comes back as ACTIVE;
    /// a RETIRED node is rejected.
    pub async fn heartbeat(
        &self,
        id: &NodeId,
        report: LoadSnapshot,
        now: DateTime<Utc>,
    ) -> Result<NodeRecord> {
        let mut recovered = false;
        let record = self
            .update(id, |node| {
                recovered = false;
                match node.status {
                    NodeStatus::Retired => {
                        return Err(BatonError::conflict(
                            node_key(id),
                            "heartbeat from retired node",
                        ));
                    }
                    NodeStatus::Unreachable => {
                        node.status = NodeStatus::Active;
                        recovered = true;
                    }
                    NodeStatus::Active | NodeStatus::Draining => {}
                }
                node.last_heartbeat = node.last_heartbeat.max(now);
                node.last_report = Some(report);
                Ok(())
            })
            .await?;

        if recovered {
            info!(node_id = %id, "unreachable node recovered");
        }
        if report.running_jobs != record.active_job_count {
            debug!(
                node_id = %id,
                reported = report.running_jobs,
                tracked = record.active_job_count,
                "node load report diverges from dispatcher count"
            );
        }
        Ok(record)
    }

    /// Stops new assignments; in-flight jobs finish.
    pub async fn drain(&self, id: &NodeId) -> Result<NodeRecord> {
        let record = self
            .update(id, |node| match node.status {
                NodeStatus::Active | NodeStatus::Draining => {
                    node.status = NodeStatus::Draining;
                    Ok(())
                }
                other => Err(BatonError::conflict(
                    node_key(id),
                    format!("cannot drain a {other} node"),
                )),
            })
            .await?;
        info!(node_id = %id, active_jobs = record.active_job_count, "node draining");
        Ok(record)
    }

    /// Marks the node RETIRED. Callers requeue its jobs.
    pub async fn retire(&self, id: &NodeId) -> Result<NodeRecord> {
        let record = self
            .update(id, |node| {
                node.status = NodeStatus::Retired;
                Ok(())
            })
            .await?;
        info!(node_id = %id, "node retired");
        Ok(record)
    }

    pub async fn get(&self, id: &NodeId) -> Result<NodeRecord> {
        self.try_get(id)
            .await?
            .ok_or_else(|| BatonError::node_not_found(id))
    }

    pub async fn try_get(&self, id: &NodeId) -> Result<Option<NodeRecord>> {
        match self.kv.get(&node_key(id)).await? {
            Some(entry) => Ok(Some(persistence::decode(entry.value)?)),
            None => Ok(None),
        }
    }

    /// All registered nodes, retired ones included, ordered by id.
    pub async fn list(&self) -> Result<Vec<NodeRecord>> {
        let mut nodes = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .kv
                .scan_prefix(NODE_PREFIX, after.as_deref(), self.page_size)
                .await?;
            let full = page.len() == self.page_size;
            for (key, entry) in page {
                nodes.push(persistence::decode(entry.value)?);
                after = Some(key);
            }
            if !full {
                return Ok(nodes);
            }
        }
    }

    /// Marks ACTIVE and DRAINING nodes whose last heartbeat is older than
    /// `timeout` as UNREACHABLE. Returns the nodes that changed.
    pub async fn sweep_at(
        &self,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Result<Vec<NodeRecord>> {
        let mut lost = Vec::new();
        for node in self.list().await? {
            let live = matches!(node.status, NodeStatus::Active | NodeStatus::Draining);
            if !live || !node.is_stale(now, timeout) {
                continue;
            }
            let outcome = self
                .update(&node.id, |current| {
                    let live = matches!(
                        current.status,
                        NodeStatus::Active | NodeStatus::Draining
                    );
                    if !live || !current.is_stale(now, timeout) {
                        return Err(BatonError::conflict(
                            node_key(&current.id),
                            "heartbeat arrived during sweep",
                        ));
                    }
                    current.status = NodeStatus::Unreachable;
                    Ok(())
                })
                .await;
            match outcome {
                Ok(record) => {
                    warn!(
                        node_id = %record.id,
                        last_heartbeat = %record.last_heartbeat,
                        active_jobs = record.active_job_count,
                        "node unreachable"
                    );
                    lost.push(record);
                }
                Err(err) if err.is_conflict() || err.is_not_found() => {
                    debug!(node_id = %node.id, "sweep skipped node: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(lost)
    }

    /// Takes one slot on an ACTIVE node with spare capacity. Fails with
    /// `Conflict` when the node is full or not accepting work.
    pub(crate) async fn acquire_slot(&self, id: &NodeId) -> Result<NodeRecord> {
        self.update(id, |node| {
            if !node.status.accepts_work() {
                return Err(BatonError::conflict(
                    node_key(id),
                    format!("node is {}", node.status),
                ));
            }
            if !node.has_free_slot() {
                return Err(BatonError::conflict(node_key(id), "node at capacity"));
            }
            node.active_job_count += 1;
            Ok(())
        })
        .await
    }

    pub(crate) async fn release_slot(&self, id: &NodeId) -> Result<NodeRecord> {
        self.update(id, |node| {
            node.active_job_count = node.active_job_count.saturating_sub(1);
            Ok(())
        })
        .await
    }

    /// Zeroes the load of a node whose jobs have all been requeued. Has no
    /// effect once the node is live again.
    pub(crate) async fn reset_load(&self, id: &NodeId) -> Result<NodeRecord> {
        self.update(id, |node| {
            if node.status.is_lost() {
                node.active_job_count = 0;
            }
            Ok(())
        })
        .await
    }
}
