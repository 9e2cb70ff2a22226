use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tracing::trace;

use crate::config::BalancerWeights;
use crate::error::{BatonError, Result};
use crate::job::JobRecord;
use crate::node::{NodeId, NodeRecord};

/// Score breakdown for one candidate node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeScore {
    pub node_id: NodeId,
    pub score: f64,
    pub load: f64,
    pub capability_match: f64,
    pub success_rate: f64,
    pub penalized: bool,
}

/// Scores candidate nodes for a job.
///
/// The recent-outcome window per `(node, job class)` is advisory soft
/// state; losing it on restart only resets the success-rate term.
#[derive(Debug)]
pub struct LoadBalancer {
    weights: BalancerWeights,
    history: Mutex<HashMap<(NodeId, String), VecDeque<bool>>>,
}

impl LoadBalancer {
    pub fn new(weights: BalancerWeights) -> Self {
        Self {
            weights,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn weights(&self) -> &BalancerWeights {
        &self.weights
    }

    /// Ranks every eligible candidate, best first. Candidates are ACTIVE
    /// nodes with a free slot whose capabilities satisfy the job.
    pub async fn rank(&self, job: &JobRecord, nodes: &[NodeRecord]) -> Result<Vec<NodeScore>> {
        let class = job.payload.job_class();
        let requirements = &job.payload.requirements;
        let history = self.history.lock().await;

        let mut ranked: Vec<NodeScore> = nodes
            .iter()
            .filter(|node| node.status.accepts_work() && node.has_free_slot())
            .filter(|node| node.capabilities.satisfies(requirements))
            .map(|node| {
                let outcomes = history.get(&(node.id.clone(), class.to_string()));
                self.score(node, node.capabilities.match_quality(requirements), outcomes)
            })
            .collect();
        drop(history);

        if ranked.is_empty() {
            return Err(BatonError::NoAvailableNodes(job.id));
        }
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        trace!(
            job_id = %job.id,
            candidates = ranked.len(),
            best = %ranked[0].node_id,
            "ranked nodes"
        );
        Ok(ranked)
    }

    pub async fn select(&self, job: &JobRecord, nodes: &[NodeRecord]) -> Result<NodeId> {
        let mut ranked = self.rank(job, nodes).await?;
        Ok(ranked.swap_remove(0).node_id)
    }

    fn score(
        &self,
        node: &NodeRecord,
        capability_match: f64,
        outcomes: Option<&VecDeque<bool>>,
    ) -> NodeScore {
        let w = &self.weights;
        let load = 1.0 - node.utilization().clamp(0.0, 1.0);

        let (successes, total) = outcomes
            .map(|o| (o.iter().filter(|ok| **ok).count(), o.len()))
            .unwrap_or((0, 0));
        // Laplace smoothing: an unknown node starts at 0.5.
        let success_rate = (successes as f64 + 1.0) / (total as f64 + 2.0);
        let failure_rate = if total == 0 {
            0.0
        } else {
            1.0 - successes as f64 / total as f64
        };

        let mut score = w.load * load
            + w.capability_match * capability_match
            + w.success_rate * success_rate;
        let penalized = total > 0 && failure_rate > w.failure_penalty_threshold;
        if penalized {
            score *= 1.0 - w.failure_penalty;
        }

        NodeScore {
            node_id: node.id.clone(),
            score,
            load,
            capability_match,
            success_rate,
            penalized,
        }
    }

    /// Remembers an executor outcome for `(node, job_class)`.
    pub async fn record_outcome(&self, node: &NodeId, job_class: &str, success: bool) {
        let mut history = self.history.lock().await;
        let window = history
            .entry((node.clone(), job_class.to_string()))
            .or_default();
        window.push_back(success);
        while window.len() > self.weights.success_window.max(1) {
            window.pop_front();
        }
    }

    /// Drops history for a node that left the pool.
    pub async fn forget_node(&self, node: &NodeId) {
        self.history.lock().await.retain(|(id, _), _| id != node);
    }
}
