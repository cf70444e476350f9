use super::{AvailabilityListener, ServiceUnreachableHook};
use crate::config::DiscoveryConfig;
use crate::coordinator::{CoordinatedTask, Submission, TaskCoordinator, TaskKey};
use crate::core::{DiscoveryError, Result, ServiceType, Status};
use crate::model::ExternalService;
use crate::remote::RemoteReader;
use crate::storage::{EntityStore, StoreTx};
use crate::transaction::run_in_transaction;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Descriptive inventory wiped from a rack chassis when its rack manager
/// goes away. The chassis itself stays.
const RACK_INVENTORY_FIELDS: &[&str] = &[
    "manufacturer",
    "model",
    "serial_number",
    "part_number",
    "asset_tag",
    "sku",
];

/// Result of a re-verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Reachable,
    Unreachable,
    /// The service was deleted meanwhile.
    Unknown,
}

enum Probe {
    Healthy,
    Failed(DiscoveryError),
    IdentityChanged(Uuid),
}

/// Drives the reachability state of external services.
pub struct ServiceHealthManager {
    store: Arc<EntityStore>,
    reader: Arc<dyn RemoteReader>,
    coordinator: Arc<TaskCoordinator>,
    config: DiscoveryConfig,
    hooks: Vec<Arc<dyn ServiceUnreachableHook>>,
    listeners: RwLock<Vec<Weak<dyn AvailabilityListener>>>,
    monitors: RwLock<HashMap<Uuid, JoinHandle<()>>>,
}

impl ServiceHealthManager {
    pub fn new(
        store: Arc<EntityStore>,
        reader: Arc<dyn RemoteReader>,
        coordinator: Arc<TaskCoordinator>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            store,
            reader,
            coordinator,
            config,
            hooks: Vec::new(),
            listeners: RwLock::new(Vec::new()),
            monitors: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_unreachable_hook(mut self, hook: Arc<dyn ServiceUnreachableHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Held weakly; the listener usually owns this manager.
    pub async fn add_listener(&self, listener: Weak<dyn AvailabilityListener>) {
        self.listeners.write().await.push(listener);
    }

    async fn listeners(&self) -> Vec<Arc<dyn AvailabilityListener>> {
        self.listeners
            .read()
            .await
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Queues a verification for the service; concurrent requests collapse.
    pub fn request_verification(self: &Arc<Self>, service_id: Uuid) -> Submission {
        let task = Arc::new(VerificationTask {
            health: Arc::clone(self),
            service_id,
        });
        self.coordinator
            .submit(TaskKey::verification(service_id), task)
            .0
    }

    /// Re-checks the service's root identity. Only a confirmed failure
    /// flips the service to unreachable.
    pub async fn verify(self: &Arc<Self>, service_id: Uuid) -> Result<Verification> {
        let Some(service) = self.store.snapshot().await.service(service_id).cloned() else {
            return Ok(Verification::Unknown);
        };

        let attempts = self.config.verification_attempts.max(1);
        let mut attempt = 1;
        let reason = loop {
            match self.probe(&service).await {
                Probe::Healthy => {
                    if !service.reachable {
                        self.mark_reachable(service_id).await?;
                    }
                    debug!(%service_id, attempt, "service verified");
                    return Ok(Verification::Reachable);
                }
                Probe::IdentityChanged(actual) => {
                    break DiscoveryError::IdentityMismatch {
                        expected: service_id,
                        actual,
                    };
                }
                Probe::Failed(err) if attempt >= attempts => break err,
                Probe::Failed(err) => {
                    debug!(%service_id, attempt, error = %err, "verification attempt failed");
                    attempt += 1;
                    tokio::time::sleep(self.config.verification_retry_delay()).await;
                }
            }
        };

        info!(%service_id, reason = %reason, "service failed verification");
        self.mark_unreachable(service_id).await?;
        Ok(Verification::Unreachable)
    }

    async fn probe(&self, service: &ExternalService) -> Probe {
        let session = match self.reader.open(&service.base_uri).await {
            Ok(session) => session,
            Err(err) => return Probe::Failed(err),
        };
        match session.root().await {
            Ok(root) if root.id == service.id => Probe::Healthy,
            Ok(root) => Probe::IdentityChanged(root.id),
            Err(err) => Probe::Failed(err),
        }
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// Marks the service unreachable and runs the unreachable hooks in the
    /// same transaction. Returns `false` if it was already unreachable or
    /// no longer exists.
    pub async fn mark_unreachable(self: &Arc<Self>, service_id: Uuid) -> Result<bool> {
        let changed = run_in_transaction(&self.store, &self.config.transaction, move |tx| {
            self.mark_unreachable_once(tx, service_id)
        })
        .await?;

        if changed {
            warn!(%service_id, "service marked unreachable");
            for listener in self.listeners().await {
                listener.service_unreachable(service_id).await;
            }
        }
        if self.store.snapshot().await.service(service_id).is_some() {
            self.start_monitoring(service_id).await;
        }
        Ok(changed)
    }

    async fn mark_unreachable_once(&self, tx: StoreTx, service_id: Uuid) -> Result<bool> {
        let Some(mut service) = tx.service(service_id).await? else {
            return Ok(false);
        };
        // Hooks already ran when it went down.
        if !service.reachable {
            return Ok(false);
        }
        service.mark_unreachable(Utc::now());
        tx.save_service(service.clone()).await?;

        if service.service_type == ServiceType::RackManager {
            self.blank_rack_chassis(&tx, service_id).await?;
        }
        for hook in &self.hooks {
            hook.on_unreachable(&tx, &service).await?;
        }
        Ok(true)
    }

    async fn blank_rack_chassis(&self, tx: &StoreTx, service_id: Uuid) -> Result<()> {
        for mut chassis in tx.entities_of_service(service_id).await? {
            if !chassis.is_rack_chassis() {
                continue;
            }
            let before = chassis.clone();
            for field in RACK_INVENTORY_FIELDS {
                chassis.properties.remove(*field);
            }
            chassis.status = Some(Status::ABSENT);
            if chassis != before {
                debug!(chassis_id = %chassis.id, "rack chassis inventory blanked");
                tx.save_entity(chassis).await?;
            }
        }
        Ok(())
    }

    /// Returns `false` if the service was already reachable or is gone.
    pub async fn mark_reachable(&self, service_id: Uuid) -> Result<bool> {
        let changed = run_in_transaction(&self.store, &self.config.transaction, move |tx| {
            self.mark_reachable_once(tx, service_id)
        })
        .await?;

        if changed {
            info!(%service_id, "service reachable again");
            for listener in self.listeners().await {
                listener.service_reachable(service_id).await;
            }
        }
        Ok(changed)
    }

    async fn mark_reachable_once(&self, tx: StoreTx, service_id: Uuid) -> Result<bool> {
        match tx.service(service_id).await? {
            Some(mut service) if !service.reachable => {
                service.mark_reachable();
                tx.save_service(service).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ========================================================================
    // Monitoring of unreachable services
    // ========================================================================

    /// Probes the service every `unreachable_check_interval` until it
    /// answers with the right identity, then marks it reachable.
    async fn start_monitoring(self: &Arc<Self>, service_id: Uuid) {
        let mut monitors = self.monitors.write().await;
        if monitors
            .get(&service_id)
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }

        let health = Arc::clone(self);
        let period = self.config.unreachable_check_interval_duration();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(service) = health.store.snapshot().await.service(service_id).cloned() else {
                    break;
                };
                if service.reachable {
                    break;
                }
                if let Probe::Healthy = health.probe(&service).await {
                    match health.mark_reachable(service_id).await {
                        Ok(_) => break,
                        Err(err) => warn!(%service_id, error = %err, "failed to mark service reachable"),
                    }
                }
            }
            health.monitors.write().await.remove(&service_id);
        });
        monitors.insert(service_id, handle);
        debug!(%service_id, "monitoring unreachable service");
    }

    pub async fn is_monitored(&self, service_id: Uuid) -> bool {
        self.monitors
            .read()
            .await
            .get(&service_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops monitoring without telling anyone.
    pub async fn stop_monitoring(&self, service_id: Uuid) {
        if let Some(handle) = self.monitors.write().await.remove(&service_id) {
            handle.abort();
        }
    }

    /// Forgets the service: monitoring stops and listeners drop their work.
    pub async fn unregister(&self, service_id: Uuid) {
        self.stop_monitoring(service_id).await;
        for listener in self.listeners().await {
            listener.service_removed(service_id).await;
        }
        debug!(%service_id, "service unregistered from availability monitoring");
    }

    pub async fn shutdown(&self) {
        let mut monitors = self.monitors.write().await;
        for (_, handle) in monitors.drain() {
            handle.abort();
        }
    }
}

struct VerificationTask {
    health: Arc<ServiceHealthManager>,
    service_id: Uuid,
}

#[async_trait]
impl CoordinatedTask for VerificationTask {
    async fn run(&self) -> Result<()> {
        self.health.verify(self.service_id).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityKind;
    use crate::model::DiscoverableEntity;
    use crate::remote::FixtureRemote;
    use crate::remote::fixture::{FixtureFailure, FixtureServiceSpec};
    use serde_json::json;
    use std::time::Duration;

    fn manager(store: &Arc<EntityStore>, remote: &FixtureRemote) -> Arc<ServiceHealthManager> {
        let config = DiscoveryConfig::new()
            .verification(2, Duration::from_millis(1))
            .unreachable_check_interval(Duration::from_millis(20));
        Arc::new(ServiceHealthManager::new(
            Arc::clone(store),
            Arc::new(remote.clone()),
            TaskCoordinator::new(),
            config,
        ))
    }

    async fn register(store: &Arc<EntityStore>, service: &ExternalService) {
        let tx = store.begin().await.unwrap();
        tx.save_service(service.clone()).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn failures_must_repeat_before_service_is_unreachable() {
        let store = EntityStore::shared();
        let remote = FixtureRemote::new();
        let id = Uuid::new_v4();
        remote.add_service(FixtureServiceSpec::new(id, ServiceType::PrimaryCompute, "http://psme"));
        remote.set_failure("http://psme", Some(FixtureFailure::Connection));
        let service = ExternalService::new(id, "http://psme", ServiceType::PrimaryCompute);
        register(&store, &service).await;

        let health = manager(&store, &remote);
        assert_eq!(health.verify(id).await.unwrap(), Verification::Unreachable);
        assert_eq!(remote.root_fetches("http://psme"), 2);
        assert!(!store.snapshot().await.service(id).unwrap().reachable);
        assert!(health.is_monitored(id).await);

        remote.set_failure("http://psme", None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.snapshot().await.service(id).unwrap().reachable);
        assert!(!health.is_monitored(id).await);
    }

    #[tokio::test]
    async fn identity_mismatch_is_confirmed_at_once() {
        let store = EntityStore::shared();
        let remote = FixtureRemote::new();
        let id = Uuid::new_v4();
        remote.add_service(FixtureServiceSpec::new(id, ServiceType::Storage, "http://rss"));
        remote.set_identity("http://rss", Uuid::new_v4());
        register(&store, &ExternalService::new(id, "http://rss", ServiceType::Storage)).await;

        let health = manager(&store, &remote);
        assert_eq!(health.verify(id).await.unwrap(), Verification::Unreachable);
        assert_eq!(remote.root_fetches("http://rss"), 1);
        health.shutdown().await;
    }

    #[tokio::test]
    async fn rack_manager_loss_blanks_rack_chassis() {
        let store = EntityStore::shared();
        let remote = FixtureRemote::new();
        let service = ExternalService::new(Uuid::new_v4(), "http://rmm", ServiceType::RackManager);
        register(&store, &service).await;

        let mut rack = DiscoverableEntity::new(EntityKind::Chassis, service.id, Some("/Chassis/Rack".into()));
        rack.status = Some(Status::ENABLED_OK);
        rack.set_property("chassis_type", json!("Rack"));
        rack.set_property("serial_number", json!("RK-001"));
        rack.set_property("manufacturer", json!("Acme"));
        rack.set_property("location", json!("row 4"));
        let tx = store.begin().await.unwrap();
        tx.save_entity(rack.clone()).await.unwrap();
        tx.commit().await.unwrap();

        let health = manager(&store, &remote);
        assert!(health.mark_unreachable(service.id).await.unwrap());
        assert!(!health.mark_unreachable(service.id).await.unwrap());

        let snapshot = store.snapshot().await;
        let blanked = snapshot.entity(rack.id).unwrap();
        assert_eq!(blanked.status, Some(Status::ABSENT));
        assert!(blanked.property_str("serial_number").is_none());
        assert!(blanked.property_str("manufacturer").is_none());
        assert_eq!(blanked.property_str("location"), Some("row 4"));
        health.shutdown().await;
    }

    #[tokio::test]
    async fn deleted_service_verifies_as_unknown() {
        let store = EntityStore::shared();
        let health = manager(&store, &FixtureRemote::new());
        assert_eq!(health.verify(Uuid::new_v4()).await.unwrap(), Verification::Unknown);
    }

    struct CountingHook(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl ServiceUnreachableHook for CountingHook {
        async fn on_unreachable(&self, _: &StoreTx, _: &ExternalService) -> Result<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn repeated_loss_of_unreachable_service_writes_nothing() {
        let store = EntityStore::shared();
        let remote = FixtureRemote::new();
        let service = ExternalService::new(Uuid::new_v4(), "http://psme", ServiceType::PrimaryCompute);
        register(&store, &service).await;

        let hook = Arc::new(CountingHook(Default::default()));
        let config = DiscoveryConfig::new().unreachable_check_interval(Duration::from_secs(3600));
        let health = Arc::new(
            ServiceHealthManager::new(Arc::clone(&store), Arc::new(remote.clone()), TaskCoordinator::new(), config)
                .with_unreachable_hook(hook.clone()),
        );

        assert!(health.mark_unreachable(service.id).await.unwrap());
        let since = store.snapshot().await.service(service.id).unwrap().unreachable_since;
        let version = store.version().await;

        assert!(!health.mark_unreachable(service.id).await.unwrap());
        assert_eq!(hook.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(store.version().await, version);
        assert_eq!(store.snapshot().await.service(service.id).unwrap().unreachable_since, since);
        health.shutdown().await;
    }
}
