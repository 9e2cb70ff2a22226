//! Auto-scaler: grows the node pool under queue pressure and drains idle
//! nodes when pressure stays low.
//!
//! Evaluations are serialized and every pool change starts a cooldown, so
//! calling [`AutoScaler::evaluate_at`] repeatedly for the same instant
//! takes at most one scaling action.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::balancer::LoadBalancer;
use crate::config::AutoScalerConfig;
use crate::error::Result;
use crate::node::{NodeId, NodeRecord, NodeStatus};
use crate::provisioner::NodeProvisioner;
use crate::queue::QueueSnapshot;
use crate::registry::NodeRegistry;
use crate::store::JobStore;
use crate::telemetry;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp { node_id: NodeId },
    /// Stop assigning work to a node; it is retired once empty.
    Drain { node_id: NodeId },
    Retire { node_id: NodeId },
}

impl ScalingAction {
    pub fn name(&self) -> &'static str {
        match self {
            ScalingAction::ScaleUp { .. } => "scale_up",
            ScalingAction::Drain { .. } => "drain",
            ScalingAction::Retire { .. } => "retire",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScalingReport {
    pub evaluated_at: DateTime<Utc>,
    pub pressure: f64,
    pub actions: Vec<ScalingAction>,
    /// Set when a scale-up was due but the provisioner failed. Retirements
    /// from the same evaluation are still listed in `actions`.
    pub provision_error: Option<String>,
}

#[derive(Debug, Default)]
struct ScalerState {
    last_action_at: Option<DateTime<Utc>>,
    low_since: Option<DateTime<Utc>>,
}

pub struct AutoScaler {
    config: AutoScalerConfig,
    store: JobStore,
    registry: NodeRegistry,
    balancer: Arc<LoadBalancer>,
    provisioner: Arc<dyn NodeProvisioner>,
    state: Mutex<ScalerState>,
}

impl std::fmt::Debug for AutoScaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoScaler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AutoScaler {
    pub fn new(
        config: AutoScalerConfig,
        store: JobStore,
        registry: NodeRegistry,
        balancer: Arc<LoadBalancer>,
        provisioner: Arc<dyn NodeProvisioner>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            balancer,
            provisioner,
            state: Mutex::new(ScalerState::default()),
        }
    }

    pub fn config(&self) -> &AutoScalerConfig {
        &self.config
    }

    pub async fn evaluate_at(&self, now: DateTime<Utc>) -> Result<ScalingReport> {
        let mut state = self.state.lock().await;
        let mut actions = self.retire_drained().await?;

        let snapshot = QueueSnapshot::capture(&self.store, &self.registry, now).await?;
        let pressure = snapshot.pressure();
        let mut report = ScalingReport {
            evaluated_at: now,
            pressure,
            actions: Vec::new(),
            provision_error: None,
        };

        if pressure < self.config.low_water {
            state.low_since.get_or_insert(now);
        } else {
            state.low_since = None;
        }

        let cooling = state
            .last_action_at
            .is_some_and(|at| {
                at.checked_add_signed(self.config.cooldown())
                    .is_none_or(|until| now < until)
            });
        if cooling {
            debug!(pressure, "auto-scaler in cooldown");
            report.actions = actions;
            return Ok(report);
        }

        if pressure > self.config.high_water && snapshot.nodes.live() < self.config.max_nodes {
            match self.provisioner.provision().await {
                Ok(node_id) => {
                    telemetry::record_scaling_action("scale_up", pressure);
                    info!(node_id = %node_id, pressure, "provisioned node");
                    actions.push(ScalingAction::ScaleUp { node_id });
                    state.last_action_at = Some(now);
                    state.low_since = None;
                }
                // No cooldown: the next evaluation tries again.
                Err(err) => {
                    warn!(pressure, "provisioner failed to add a node: {err:#}");
                    report.provision_error = Some(format!("{err:#}"));
                }
            }
        } else if let Some(since) = state.low_since
            && now - since >= self.config.sustained_low()
            && snapshot.nodes.active > self.config.min_nodes
        {
            let nodes = self.registry.list().await?;
            if let Some(node) = least_utilized(&nodes) {
                let drained = self.registry.drain(&node.id).await?;
                telemetry::record_scaling_action("drain", pressure);
                info!(node_id = %drained.id, pressure, "draining idle node");
                actions.push(ScalingAction::Drain {
                    node_id: drained.id,
                });
                state.last_action_at = Some(now);
                state.low_since = None;
            }
        }

        report.actions = actions;
        Ok(report)
    }

    /// Retires DRAINING nodes that no longer hold any job.
    async fn retire_drained(&self) -> Result<Vec<ScalingAction>> {
        let mut retired = Vec::new();
        for node in self.registry.list().await? {
            if node.status != NodeStatus::Draining || node.active_job_count > 0 {
                continue;
            }
            if let Err(err) = self.provisioner.retire(&node.id).await {
                warn!(node_id = %node.id, "provisioner failed to retire node: {err:#}");
                continue;
            }
            match self.registry.retire(&node.id).await {
                Ok(_) => {
                    self.balancer.forget_node(&node.id).await;
                    telemetry::record_scaling_action("retire", 0.0);
                    retired.push(ScalingAction::Retire { node_id: node.id });
                }
                Err(err) if err.is_not_found() || err.is_conflict() => {
                    debug!(node_id = %node.id, "retire skipped: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(retired)
    }
}

/// The ACTIVE node with the lowest utilization; ties go to the smallest id.
fn least_utilized(nodes: &[NodeRecord]) -> Option<&NodeRecord> {
    nodes
        .iter()
        .filter(|node| node.status == NodeStatus::Active)
        .min_by(|a, b| {
            a.utilization()
                .total_cmp(&b.utilization())
                .then_with(|| a.id.cmp(&b.id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalancerWeights;
    use crate::job::{JobId, JobPayload, JobRecord, JobSubmission};
    use crate::node::NodeRegistration;
    use crate::persistence::InMemoryKvStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProvisioner {
        provisioned: AtomicUsize,
        retired: AtomicUsize,
        unavailable: AtomicBool,
    }

    #[async_trait]
    impl NodeProvisioner for CountingProvisioner {
        async fn provision(&self) -> anyhow::Result<NodeId> {
            if self.unavailable.load(Ordering::SeqCst) {
                anyhow::bail!("capacity pool exhausted");
            }
            let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(NodeId::new(format!("auto-{n}")))
        }

        async fn retire(&self, _node_id: &NodeId) -> anyhow::Result<()> {
            self.retired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        store: JobStore,
        registry: NodeRegistry,
        provisioner: Arc<CountingProvisioner>,
        scaler: AutoScaler,
    }

    fn fixture(config: AutoScalerConfig) -> Fixture {
        let kv = Arc::new(InMemoryKvStore::new());
        let store = JobStore::new(kv.clone(), 16);
        let registry = NodeRegistry::new(kv, 16);
        let provisioner = Arc::new(CountingProvisioner::default());
        let scaler = AutoScaler::new(
            config,
            store.clone(),
            registry.clone(),
            Arc::new(LoadBalancer::new(BalancerWeights::default())),
            provisioner.clone(),
        );
        Fixture {
            store,
            registry,
            provisioner,
            scaler,
        }
    }

    async fn add_eligible(store: &JobStore, count: usize, now: DateTime<Utc>) {
        for seq in 0..count {
            let mut record = JobRecord::new(
                JobId::new(),
                JobSubmission::new(JobPayload::new("in.mov")),
                3,
                3600,
                seq as u64,
                now,
            );
            record.mark_eligible(now).unwrap();
            store.insert(&record).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_scale_up_once_per_cooldown() {
        let f = fixture(AutoScalerConfig::default());
        let now = Utc::now();
        f.registry
            .register(NodeRegistration::new("n1", 1), now)
            .await
            .unwrap();
        add_eligible(&f.store, 4, now).await;

        let first = f.scaler.evaluate_at(now).await.unwrap();
        let second = f.scaler.evaluate_at(now).await.unwrap();

        assert_eq!(first.pressure, 4.0);
        assert_eq!(first.actions.len(), 1);
        assert_eq!(first.actions[0].name(), "scale_up");
        assert!(second.actions.is_empty());
        assert_eq!(f.provisioner.provisioned.load(Ordering::SeqCst), 1);

        let later = now + f.scaler.config().cooldown() + Duration::seconds(1);
        let third = f.scaler.evaluate_at(later).await.unwrap();
        assert_eq!(third.actions.len(), 1);
    }

    #[tokio::test]
    async fn test_respects_max_nodes() {
        let f = fixture(AutoScalerConfig {
            max_nodes: 1,
            ..AutoScalerConfig::default()
        });
        let now = Utc::now();
        f.registry
            .register(NodeRegistration::new("n1", 1), now)
            .await
            .unwrap();
        add_eligible(&f.store, 10, now).await;

        let report = f.scaler.evaluate_at(now).await.unwrap();
        assert!(report.actions.is_empty());
    }

    #[tokio::test]
    async fn test_sustained_low_pressure_drains_then_retires() {
        let f = fixture(AutoScalerConfig {
            min_nodes: 1,
            ..AutoScalerConfig::default()
        });
        let now = Utc::now();
        for id in ["n1", "n2"] {
            f.registry
                .register(NodeRegistration::new(id, 4), now)
                .await
                .unwrap();
        }

        let first = f.scaler.evaluate_at(now).await.unwrap();
        assert!(first.actions.is_empty(), "low pressure must be sustained");

        let later = now + f.scaler.config().sustained_low();
        let second = f.scaler.evaluate_at(later).await.unwrap();
        assert_eq!(
            second.actions,
            vec![ScalingAction::Drain {
                node_id: NodeId::new("n1")
            }]
        );

        // The drained node is idle, so the next evaluation retires it even
        // inside the cooldown.
        let third = f.scaler.evaluate_at(later).await.unwrap();
        assert_eq!(
            third.actions,
            vec![ScalingAction::Retire {
                node_id: NodeId::new("n1")
            }]
        );
        assert_eq!(f.provisioner.retired.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.registry.get(&NodeId::new("n1")).await.unwrap().status,
            NodeStatus::Retired
        );
    }

    #[tokio::test]
    async fn test_failed_provision_keeps_retirements_in_report() {
        let f = fixture(AutoScalerConfig::default());
        let now = Utc::now();
        for id in ["n1", "n2"] {
            f.registry
                .register(NodeRegistration::new(id, 1), now)
                .await
                .unwrap();
        }
        f.registry.drain(&NodeId::new("n2")).await.unwrap();
        add_eligible(&f.store, 4, now).await;
        f.provisioner.unavailable.store(true, Ordering::SeqCst);

        let report = f.scaler.evaluate_at(now).await.unwrap();
        assert_eq!(
            report.actions,
            vec![ScalingAction::Retire {
                node_id: NodeId::new("n2")
            }]
        );
        assert!(
            report
                .provision_error
                .as_deref()
                .is_some_and(|err| err.contains("capacity pool exhausted"))
        );

        f.provisioner.unavailable.store(false, Ordering::SeqCst);
        let retry = f.scaler.evaluate_at(now).await.unwrap();
        assert_eq!(retry.actions.len(), 1);
        assert_eq!(retry.actions[0].name(), "scale_up");
        assert!(retry.provision_error.is_none());
    }

    #[tokio::test]
    async fn test_never_drains_below_min_nodes() {
        let f = fixture(AutoScalerConfig {
            min_nodes: 1,
            ..AutoScalerConfig::default()
        });
        let now = Utc::now();
        f.registry
            .register(NodeRegistration::new("n1", 4), now)
            .await
            .unwrap();

        f.scaler.evaluate_at(now).await.unwrap();
        let later = now + f.scaler.config().sustained_low() + Duration::seconds(5);
        let report = f.scaler.evaluate_at(later).await.unwrap();
        assert!(report.actions.is_empty());
    }

    #[test]
    fn test_least_utilized_tie_breaks_by_id() {
        let now = Utc::now();
        let mut busy = NodeRecord::from_registration(NodeRegistration::new("a", 2), now);
        busy.active_job_count = 1;
        let idle_b = NodeRecord::from_registration(NodeRegistration::new("b", 2), now);
        let idle_c = NodeRecord::from_registration(NodeRegistration::new("c", 2), now);
        let nodes = vec![idle_c, busy, idle_b];
        assert_eq!(least_utilized(&nodes).map(|n| n.id.as_str()), Some("b"));
    }
}
