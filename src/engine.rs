//! Wiring facade: builds the discovery stack over one store and exposes
//! the detection entry points.

use crate::composition::ComposedNodeUpdater;
use crate::config::DiscoveryConfig;
use crate::coordinator::{Submission, TaskCoordinator};
use crate::core::{EntityKind, Result};
use crate::discovery::{DiscoveryScheduler, RunnerContext, Scheduled};
use crate::guard::{StorageGuard, StorageServiceFinalizer};
use crate::health::{
    AvailabilityListener, ServiceHealthManager, ServiceRemovalTask, ServiceRemovalWorker,
    spawn_service_removal_worker,
};
use crate::mapping::{
    DeepDiscoveryCompletion, DiscoveryGraphMapper, EntityMultiMapper, FinalizerRegistry,
    MapperRegistry,
};
use crate::model::{ExternalService, ServiceEndpoint};
use crate::registry::{Registration, ServiceRegistry};
use crate::remote::{
    CrawlingGraphBuilder, DeepDiscoveryLauncher, EventSubscriber, FixtureRemote, GraphBuilder,
    RemoteReader,
};
use crate::sanitize::SanitizerSet;
use crate::storage::{EntityStore, StoreState};
use crate::transaction::run_in_transaction;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Southbound implementations the engine talks through.
#[derive(Clone)]
pub struct RemoteCollaborators {
    pub reader: Arc<dyn RemoteReader>,
    pub builder: Arc<dyn GraphBuilder>,
    pub subscriber: Arc<dyn EventSubscriber>,
    pub launcher: Arc<dyn DeepDiscoveryLauncher>,
}

impl RemoteCollaborators {
    pub fn from_fixture(remote: &FixtureRemote) -> Self {
        Self {
            reader: Arc::new(remote.clone()),
            builder: Arc::new(CrawlingGraphBuilder::new()),
            subscriber: Arc::new(remote.clone()),
            launcher: Arc::new(remote.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub sanitized: BTreeMap<&'static str, usize>,
    pub protected_systems: usize,
    pub rescheduled_services: usize,
}

/// Point-in-time view of what the engine has persisted.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub version: u64,
    pub services: Vec<ExternalService>,
    pub entities_by_kind: BTreeMap<String, usize>,
    pub entities: usize,
    pub links: usize,
    pub composed_nodes: usize,
    pub protected_systems: Vec<Uuid>,
}

pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    store: Arc<EntityStore>,
    coordinator: Arc<TaskCoordinator>,
    guard: Arc<StorageGuard>,
    health: Arc<ServiceHealthManager>,
    scheduler: Arc<DiscoveryScheduler>,
    removal: Arc<ServiceRemovalTask>,
    removal_worker: Mutex<Option<ServiceRemovalWorker>>,
    registry: ServiceRegistry,
    sanitizers: SanitizerSet,
}

impl DiscoveryEngine {
    pub async fn new(
        config: DiscoveryConfig,
        store: Arc<EntityStore>,
        remote: RemoteCollaborators,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let coordinator = TaskCoordinator::new();
        let guard = Arc::new(StorageGuard::new()?);
        let updater = Arc::new(ComposedNodeUpdater::new());

        let mappers = Arc::new(MapperRegistry::with_default_mappers());
        let multi_mapper = Arc::new(
            EntityMultiMapper::new(mappers, config.deep_discovery_enabled)
                .with_removal_listener(updater.clone()),
        );

        let mut finalizers = FinalizerRegistry::new();
        finalizers.register(Box::new(ComposedNodeUpdater::new()));
        finalizers.register(Box::new(StorageServiceFinalizer::new(Arc::clone(&guard))));
        finalizers.register(Box::new(DeepDiscoveryCompletion));

        let mapper = Arc::new(DiscoveryGraphMapper::new(
            Arc::clone(&store),
            config.transaction.clone(),
            multi_mapper,
            Arc::new(finalizers),
        ));

        let health = Arc::new(
            ServiceHealthManager::new(
                Arc::clone(&store),
                Arc::clone(&remote.reader),
                Arc::clone(&coordinator),
                config.clone(),
            )
            .with_unreachable_hook(updater.clone()),
        );

        let context = RunnerContext {
            store: Arc::clone(&store),
            reader: remote.reader,
            builder: remote.builder,
            mapper,
            health: Arc::clone(&health),
            config: config.clone(),
        };
        let scheduler = Arc::new(DiscoveryScheduler::new(
            context,
            Arc::clone(&coordinator),
            remote.subscriber,
            remote.launcher,
            Arc::clone(&guard),
        ));
        let listener: Arc<dyn AvailabilityListener> = scheduler.clone();
        health.add_listener(Arc::downgrade(&listener)).await;

        let removal = Arc::new(
            ServiceRemovalTask::new(
                Arc::clone(&store),
                config.transaction.clone(),
                Arc::clone(&health),
                Arc::clone(&guard),
                config.service_removal_delay(),
            )?
            .with_removal_listener(updater),
        );

        Ok(Arc::new(Self {
            config,
            store,
            coordinator,
            guard,
            health,
            scheduler,
            removal,
            removal_worker: Mutex::new(None),
            registry: ServiceRegistry::new(),
            sanitizers: SanitizerSet::with_defaults(),
        }))
    }

    /// Engine over a fresh store and the in-memory fixture remote.
    pub async fn with_fixture(config: DiscoveryConfig, remote: &FixtureRemote) -> Result<Arc<Self>> {
        Self::new(config, EntityStore::shared(), RemoteCollaborators::from_fixture(remote)).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Sanitizes leftover state, reloads the storage guard, reschedules
    /// known reachable services and starts the removal sweeper.
    pub async fn start(&self) -> Result<StartupReport> {
        let sanitized = self.sanitizers.run(&self.store, &self.config.transaction).await?;
        let protected_systems = self.guard.load(&self.store.snapshot().await).await;

        let reachable: Vec<Uuid> = self
            .store
            .snapshot()
            .await
            .services()
            .into_iter()
            .filter(|service| service.reachable)
            .map(|service| service.id)
            .collect();
        let outcomes = join_all(
            reachable
                .iter()
                .map(|id| self.scheduler.schedule_with_event_subscription(*id)),
        )
        .await;
        let mut rescheduled_services = 0;
        for (service_id, outcome) in reachable.iter().zip(outcomes) {
            match outcome {
                Ok(Scheduled::AlreadyScheduled) => {}
                Ok(_) => rescheduled_services += 1,
                Err(err) => warn!(%service_id, error = %err, "failed to reschedule service"),
            }
        }

        let mut worker = self.removal_worker.lock().await;
        if worker.is_none() {
            *worker = Some(spawn_service_removal_worker(
                Arc::clone(&self.removal),
                self.config.removal_check_interval(),
            ));
        }

        let report = StartupReport {
            sanitized,
            protected_systems,
            rescheduled_services,
        };
        info!(?report, "discovery engine started");
        Ok(report)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(worker) = self.removal_worker.lock().await.take() {
            worker.stop().await?;
        }
        self.scheduler.shutdown().await;
        self.health.shutdown().await;
        info!("discovery engine stopped");
        Ok(())
    }

    // ========================================================================
    // Detection entry points
    // ========================================================================

    /// A service showed up on the network (first time, or again).
    pub async fn on_service_detected(&self, endpoint: &ServiceEndpoint) -> Result<Registration> {
        let (service, registration) =
            run_in_transaction(&self.store, &self.config.transaction, move |tx| async move {
                self.registry.register_or_update(&tx, endpoint).await
            })
            .await?;

        if registration == Registration::Updated {
            self.health.stop_monitoring(service.id).await;
        }
        let scheduled = self.scheduler.schedule_with_event_subscription(service.id).await?;
        debug!(service_id = %service.id, ?registration, ?scheduled, "service detected");
        Ok(registration)
    }

    /// Detection lost sight of the service; let verification decide.
    pub fn on_service_lost(&self, service_id: Uuid) -> Submission {
        self.health.request_verification(service_id)
    }

    /// The service pushed a change notification.
    pub async fn on_event(&self, service_id: Uuid) -> Result<Submission> {
        self.scheduler.on_event(service_id).await
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<TaskCoordinator> {
        &self.coordinator
    }

    pub fn guard(&self) -> &Arc<StorageGuard> {
        &self.guard
    }

    pub fn health(&self) -> &Arc<ServiceHealthManager> {
        &self.health
    }

    pub fn scheduler(&self) -> &Arc<DiscoveryScheduler> {
        &self.scheduler
    }

    pub fn removal_task(&self) -> &Arc<ServiceRemovalTask> {
        &self.removal
    }

    pub async fn snapshot(&self) -> StoreState {
        self.store.snapshot().await
    }

    pub async fn summary(&self) -> EngineSummary {
        let state = self.store.snapshot().await;
        let mut entities_by_kind: BTreeMap<String, usize> = BTreeMap::new();
        for kind in EntityKind::ALL {
            let count = state.entities_of_kind(kind).len();
            if count > 0 {
                entities_by_kind.insert(kind.to_string(), count);
            }
        }
        let mut services = state.services();
        services.sort_by_key(|service| service.created_at);

        EngineSummary {
            version: state.version(),
            services,
            entities_by_kind,
            entities: state.entity_count(),
            links: state.links().len(),
            composed_nodes: state.composed_nodes().len(),
            protected_systems: self.guard.protected_systems().await,
        }
    }
}
