use std::fmt;
use std::sync::Arc;

use crate::analyzer::ContentAnalyzer;
use crate::autoscaler::AutoScaler;
use crate::balancer::LoadBalancer;
use crate::config::CoordinatorConfig;
use crate::dependency::DependencyTracker;
use crate::dispatcher::Dispatcher;
use crate::events::{InProcEventBus, JobEventPublisher};
use crate::executor::ProcessingExecutor;
use crate::persistence::{InMemoryKvStore, KeyValueStore};
use crate::provisioner::NodeProvisioner;
use crate::registry::NodeRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::{PriorityScheduler, Scheduler};
use crate::store::JobStore;

use super::supervisor::{Coordinator, CoordinatorParts};

/// Builder for a [`Coordinator`].
///
/// Only the executor is required. Without a key-value store the
/// coordinator keeps everything in memory; without a provisioner the
/// auto-scaler is disabled.
///
/// # Example
///
/// ```ignore
/// use baton::*;
///
/// let coordinator = CoordinatorBuilder::new(CoordinatorConfig::default())
///     .with_executor(executor)
///     .with_kv_store(Arc::new(JsonFileKvStore::open("state.json").await?))
///     .with_provisioner(provisioner)
///     .build()?;
/// coordinator.start().await?;
/// ```
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    kv: Option<Arc<dyn KeyValueStore>>,
    executor: Option<Arc<dyn ProcessingExecutor>>,
    provisioner: Option<Arc<dyn NodeProvisioner>>,
    analyzer: Option<Arc<dyn ContentAnalyzer>>,
    events: Option<Arc<dyn JobEventPublisher>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl fmt::Debug for CoordinatorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorBuilder")
            .field("config", &self.config)
            .field("kv_set", &self.kv.is_some())
            .field("executor_set", &self.executor.is_some())
            .field("provisioner_set", &self.provisioner.is_some())
            .field("analyzer_set", &self.analyzer.is_some())
            .field("events_set", &self.events.is_some())
            .field("scheduler_set", &self.scheduler.is_some())
            .finish()
    }
}

impl CoordinatorBuilder {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            kv: None,
            executor: None,
            provisioner: None,
            analyzer: None,
            events: None,
            scheduler: None,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn with_kv_store(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ProcessingExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn NodeProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn ContentAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn JobEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replaces the default strict-priority scheduler.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> anyhow::Result<Coordinator> {
        self.config.validate()?;
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("executor dependency missing"))?;

        let config = self.config;
        let kv = self
            .kv
            .unwrap_or_else(|| Arc::new(InMemoryKvStore::new()) as Arc<dyn KeyValueStore>);
        let events = self.events.unwrap_or_else(|| {
            Arc::new(InProcEventBus::new(config.event_bus_capacity)) as Arc<dyn JobEventPublisher>
        });

        let store = JobStore::new(kv.clone(), config.page_size);
        let registry = NodeRegistry::new(kv, config.page_size);
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| {
                Arc::new(PriorityScheduler::new(store.clone())) as Arc<dyn Scheduler>
            });
        let balancer = Arc::new(LoadBalancer::new(config.balancer.clone()));
        let tracker = DependencyTracker::new(store.clone(), events.clone());
        let dispatcher = Dispatcher::new(
            store.clone(),
            registry.clone(),
            scheduler,
            balancer.clone(),
            tracker.clone(),
            RetryPolicy::new(config.retry.clone()),
            executor,
            events.clone(),
            config.scheduler.max_dispatch_per_pass,
        );
        let autoscaler = self.provisioner.map(|provisioner| {
            AutoScaler::new(
                config.autoscaler.clone(),
                store.clone(),
                registry.clone(),
                balancer.clone(),
                provisioner,
            )
        });

        Ok(Coordinator::from_parts(CoordinatorParts {
            config,
            store,
            registry,
            tracker,
            balancer,
            dispatcher,
            autoscaler,
            analyzer: self.analyzer,
            events,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionOutcome, ExecutionTask, ProgressReporter};
    use crate::runtime::CancelSignal;
    use async_trait::async_trait;

    struct NoopExecutor;

    #[async_trait]
    impl ProcessingExecutor for NoopExecutor {
        async fn execute(
            &self,
            _task: ExecutionTask,
            _progress: ProgressReporter,
            _abort: CancelSignal,
        ) -> anyhow::Result<ExecutionOutcome> {
            Ok(ExecutionOutcome::Succeeded)
        }
    }

    #[test]
    fn test_build_requires_executor() {
        let err = CoordinatorBuilder::new(CoordinatorConfig::default())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("executor"));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = CoordinatorConfig::default();
        config.autoscaler.min_nodes = 10;
        config.autoscaler.max_nodes = 2;
        let result = CoordinatorBuilder::new(config)
            .with_executor(Arc::new(NoopExecutor))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_build_with_defaults() {
        let coordinator = CoordinatorBuilder::new(CoordinatorConfig::default())
            .with_executor(Arc::new(NoopExecutor))
            .build()
            .unwrap();
        assert!(coordinator.nodes().await.unwrap().is_empty());
        assert!(coordinator.autoscale_at(chrono::Utc::now()).await.unwrap().is_none());
    }
}
