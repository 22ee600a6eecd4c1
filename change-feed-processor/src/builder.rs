use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bootstrapper::Bootstrapper;
use crate::config::{BootstrapOptions, Config, LeaseOptions, ProcessorOptions};
use crate::controller::PartitionController;
use crate::error::{Error, Result};
use crate::estimator::RemainingWorkEstimator;
use crate::feed::ChangeFeedSource;
use crate::health::{HealthMonitor, TracingHealthMonitor};
use crate::lease::{LeaseContainer, LeaseManager, LeaseStore};
use crate::load_balancer::LoadBalancer;
use crate::observer::{observer_fn, ChangeFeedObserverFactory};
use crate::partition_manager::PartitionManager;
use crate::store::DocumentStore;
use crate::strategy::{EqualPartitionsStrategy, LoadBalancingStrategy};
use crate::supervisor::DefaultSupervisorFactory;
use crate::synchronizer::PartitionSynchronizer;

const DEFAULT_DEGREE_OF_PARALLELISM: usize = 25;

/// Assembles a [`ChangeFeedProcessor`] (or an estimator) over one monitored
/// feed and one lease store.
///
/// ```ignore
/// let processor = ChangeFeedProcessorBuilder::new(source)
///     .with_instance_name("worker-1")
///     .with_lease_store(store)
///     .with_handler(|changes, _cancel| async move {
///         println!("{} changes", changes.len());
///         Ok(())
///     })
///     .build()?;
/// processor.start().await?;
/// ```
pub struct ChangeFeedProcessorBuilder {
    source: Arc<dyn ChangeFeedSource>,
    instance_name: Option<String>,
    lease_store: Option<Arc<dyn DocumentStore>>,
    observers: Option<Arc<dyn ChangeFeedObserverFactory>>,
    lease_options: LeaseOptions,
    processor_options: ProcessorOptions,
    bootstrap_options: BootstrapOptions,
    degree_of_parallelism: usize,
    health: Arc<dyn HealthMonitor>,
    strategy: Option<Arc<dyn LoadBalancingStrategy>>,
}

impl ChangeFeedProcessorBuilder {
    pub fn new(source: Arc<dyn ChangeFeedSource>) -> Self {
        Self {
            source,
            instance_name: None,
            lease_store: None,
            observers: None,
            lease_options: LeaseOptions::default(),
            processor_options: ProcessorOptions::default(),
            bootstrap_options: BootstrapOptions::default(),
            degree_of_parallelism: DEFAULT_DEGREE_OF_PARALLELISM,
            health: Arc::new(TracingHealthMonitor),
            strategy: None,
        }
    }

    /// Take every knob from environment configuration.
    pub fn with_config(mut self, config: &Config) -> Result<Self> {
        self.instance_name = Some(config.instance_name.clone());
        self.lease_options = config.lease_options();
        self.processor_options = config.processor_options()?;
        self.bootstrap_options = config.bootstrap_options();
        self.degree_of_parallelism = config.degree_of_parallelism;
        Ok(self)
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    pub fn with_lease_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.lease_store = Some(store);
        self
    }

    pub fn with_observer_factory(mut self, observers: Arc<dyn ChangeFeedObserverFactory>) -> Self {
        self.observers = Some(observers);
        self
    }

    pub fn with_handler<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Vec<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.with_observer_factory(observer_fn(handler))
    }

    pub fn with_lease_options(mut self, options: LeaseOptions) -> Self {
        self.lease_options = options;
        self
    }

    pub fn with_processor_options(mut self, options: ProcessorOptions) -> Self {
        self.processor_options = options;
        self
    }

    pub fn with_bootstrap_options(mut self, options: BootstrapOptions) -> Self {
        self.bootstrap_options = options;
        self
    }

    pub fn with_degree_of_parallelism(mut self, degree: usize) -> Self {
        self.degree_of_parallelism = degree;
        self
    }

    pub fn with_health_monitor(mut self, health: Arc<dyn HealthMonitor>) -> Self {
        self.health = health;
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn LoadBalancingStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    fn lease_store(&self) -> Result<Arc<dyn DocumentStore>> {
        self.lease_store
            .clone()
            .ok_or_else(|| Error::invalid_state("a lease store is required"))
    }

    pub fn build(self) -> Result<ChangeFeedProcessor> {
        self.lease_options.validate()?;
        let store = self.lease_store()?;
        let worker = self
            .instance_name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::invalid_state("an instance name is required"))?;
        let observers = self
            .observers
            .clone()
            .ok_or_else(|| Error::invalid_state("a change handler is required"))?;
        let prefix = self.lease_options.prefix.clone();

        let manager = Arc::new(LeaseManager::new(
            store.clone(),
            prefix.clone(),
            worker.clone(),
        ));
        let container = Arc::new(LeaseContainer::new(store.clone(), prefix.clone()));
        let lease_store = Arc::new(LeaseStore::new(store, prefix, worker.clone()));
        let synchronizer = Arc::new(PartitionSynchronizer::new(
            self.source.clone(),
            manager.clone(),
            container.clone(),
            self.degree_of_parallelism,
        ));
        let supervisors = Arc::new(DefaultSupervisorFactory::new(
            manager.clone(),
            self.source.clone(),
            observers,
            self.processor_options.clone(),
            self.lease_options.renew_interval,
        ));
        let controller = PartitionController::new(
            manager,
            container.clone(),
            synchronizer.clone(),
            supervisors,
            self.health.clone(),
        );
        let strategy: Arc<dyn LoadBalancingStrategy> = match self.strategy.clone() {
            Some(strategy) => strategy,
            None => Arc::new(EqualPartitionsStrategy::new(
                self.lease_options.expiration_interval,
                self.lease_options.min_lease_count,
                self.lease_options.max_lease_count,
            )),
        };
        let balancer = Arc::new(LoadBalancer::new(
            controller.clone(),
            container,
            lease_store.clone(),
            strategy,
            self.health.clone(),
            worker.clone(),
            self.lease_options.acquire_interval,
            self.lease_options.expiration_interval,
        ));
        let bootstrapper = Bootstrapper::new(
            synchronizer,
            lease_store.clone(),
            self.bootstrap_options.clone(),
        );

        Ok(ChangeFeedProcessor {
            instance_name: worker,
            controller: controller.clone(),
            manager: PartitionManager::new(bootstrapper, controller, balancer, lease_store),
        })
    }

    /// An estimator over the same lease store. Needs no instance name or
    /// handler.
    pub fn build_estimator(self) -> Result<RemainingWorkEstimator> {
        let store = self.lease_store()?;
        let container = Arc::new(LeaseContainer::new(store, self.lease_options.prefix.clone()));
        Ok(RemainingWorkEstimator::new(
            container,
            self.source,
            self.degree_of_parallelism,
        ))
    }
}

/// A running (or runnable) worker of a change feed processor.
pub struct ChangeFeedProcessor {
    instance_name: String,
    controller: PartitionController,
    manager: PartitionManager,
}

impl ChangeFeedProcessor {
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub async fn start(&self) -> Result<()> {
        self.manager.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.manager.stop().await
    }

    /// Partition tokens currently supervised by this worker.
    pub fn owned_partitions(&self) -> Result<HashSet<String>> {
        self.controller.owned_partitions()
    }
}
