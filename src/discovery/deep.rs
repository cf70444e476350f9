//! Deep discovery trigger: boots eligible compute systems of one service
//! into the limited image so it can report them in full.

use crate::coordinator::CoordinatedTask;
use crate::core::{DeepDiscoveryState, EntityKind, Result};
use crate::guard::StorageGuard;
use crate::model::DiscoverableEntity;
use crate::remote::DeepDiscoveryLauncher;
use crate::storage::{EntityStore, StoreTx};
use crate::transaction::{TransactionPolicy, run_in_transaction};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeepTriggerReport {
    /// Systems moved from `Initial` to `WaitingToStart`.
    pub queued: usize,
    /// Systems launched and moved to `Running`.
    pub launched: usize,
    /// Queued systems sent back to `Initial` because they became protected.
    pub withdrawn: usize,
}

pub struct DeepDiscoveryTrigger {
    service_id: Uuid,
    store: Arc<EntityStore>,
    policy: TransactionPolicy,
    guard: Arc<StorageGuard>,
    launcher: Arc<dyn DeepDiscoveryLauncher>,
}

impl DeepDiscoveryTrigger {
    pub fn new(
        service_id: Uuid,
        store: Arc<EntityStore>,
        policy: TransactionPolicy,
        guard: Arc<StorageGuard>,
        launcher: Arc<dyn DeepDiscoveryLauncher>,
    ) -> Self {
        Self {
            service_id,
            store,
            policy,
            guard,
            launcher,
        }
    }

    pub async fn trigger(&self) -> Result<DeepTriggerReport> {
        let withdrawn = run_in_transaction(&self.store, &self.policy, |tx| self.withdraw_protected(tx)).await?;
        let queued = run_in_transaction(&self.store, &self.policy, |tx| self.queue_initial(tx)).await?;

        let waiting: Vec<DiscoverableEntity> = self
            .store
            .snapshot()
            .await
            .entities_where(|entity| {
                entity.service_id == self.service_id
                    && entity.kind == EntityKind::ComputerSystem
                    && entity.metadata.deep_discovery_state == DeepDiscoveryState::WaitingToStart
            });

        let mut launched = 0;
        for system in waiting {
            // The guard may have picked the system up since it was queued.
            if self.is_shielded(&system).await {
                continue;
            }
            if let Err(err) = self.launcher.launch(&system).await {
                warn!(system_id = %system.id, error = %err, "deep discovery launch failed");
                continue;
            }
            let system_id = system.id;
            let started = run_in_transaction(&self.store, &self.policy, move |tx| {
                self.mark_running(tx, system_id)
            })
            .await?;
            if started {
                info!(%system_id, "deep discovery running");
                launched += 1;
            }
        }

        let report = DeepTriggerReport {
            queued,
            launched,
            withdrawn,
        };
        if report != DeepTriggerReport::default() {
            debug!(service_id = %self.service_id, queued, launched, withdrawn, "deep discovery trigger");
        }
        Ok(report)
    }

    /// Storage hosts and allocated systems are never booted into the
    /// limited image.
    async fn is_shielded(&self, system: &DiscoverableEntity) -> bool {
        system.metadata.allocated || system.metadata.storage_service_host || self.guard.is_protected(system.id).await
    }

    async fn withdraw_protected(&self, tx: StoreTx) -> Result<usize> {
        let waiting = tx
            .entities_where(|entity| {
                entity.service_id == self.service_id
                    && entity.kind == EntityKind::ComputerSystem
                    && entity.metadata.deep_discovery_state == DeepDiscoveryState::WaitingToStart
            })
            .await?;

        let mut withdrawn = 0;
        for mut system in waiting {
            if !self.is_shielded(&system).await {
                continue;
            }
            info!(system_id = %system.id, "protected system withdrawn from deep discovery");
            system.metadata.deep_discovery_state = DeepDiscoveryState::Initial;
            tx.save_entity(system).await?;
            withdrawn += 1;
        }
        Ok(withdrawn)
    }

    async fn queue_initial(&self, tx: StoreTx) -> Result<usize> {
        let candidates = tx
            .entities_where(|entity| {
                entity.service_id == self.service_id
                    && entity.kind == EntityKind::ComputerSystem
                    && entity.metadata.deep_discovery_state == DeepDiscoveryState::Initial
                    && !entity.metadata.allocated
                    && !entity.metadata.storage_service_host
            })
            .await?;

        let mut queued = 0;
        for mut system in candidates {
            if self.guard.is_protected(system.id).await {
                continue;
            }
            system.metadata.deep_discovery_state = DeepDiscoveryState::WaitingToStart;
            tx.save_entity(system).await?;
            queued += 1;
        }
        Ok(queued)
    }

    async fn mark_running(&self, tx: StoreTx, system_id: Uuid) -> Result<bool> {
        match tx.entity(system_id).await? {
            Some(mut system) if system.metadata.deep_discovery_state == DeepDiscoveryState::WaitingToStart => {
                if self.is_shielded(&system).await {
                    system.metadata.deep_discovery_state = DeepDiscoveryState::Initial;
                    tx.save_entity(system).await?;
                    return Ok(false);
                }
                system.metadata.deep_discovery_state = DeepDiscoveryState::Running;
                tx.save_entity(system).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CoordinatedTask for DeepDiscoveryTrigger {
    async fn run(&self) -> Result<()> {
        self.trigger().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServiceType;
    use crate::model::ExternalService;
    use crate::remote::FixtureRemote;
    use crate::remote::fixture::FixtureServiceSpec;

    #[tokio::test]
    async fn eligible_systems_are_queued_then_launched() {
        let store = EntityStore::shared();
        let guard = Arc::new(StorageGuard::new().unwrap());
        let remote = FixtureRemote::new();
        let service = ExternalService::new(Uuid::new_v4(), "http://psme", ServiceType::PrimaryCompute);
        remote.add_service(FixtureServiceSpec::new(service.id, ServiceType::PrimaryCompute, "http://psme"));

        let free = DiscoverableEntity::new(EntityKind::ComputerSystem, service.id, Some("/Systems/1".into()));
        let mut allocated = DiscoverableEntity::new(EntityKind::ComputerSystem, service.id, Some("/Systems/2".into()));
        allocated.metadata.allocated = true;
        let mut storage_host = DiscoverableEntity::new(EntityKind::ComputerSystem, service.id, Some("/Systems/3".into()));
        storage_host.metadata.storage_service_host = true;

        let tx = store.begin().await.unwrap();
        tx.save_service(service.clone()).await.unwrap();
        for system in [&free, &allocated, &storage_host] {
            tx.save_entity(system.clone()).await.unwrap();
        }
        tx.commit().await.unwrap();

        let trigger = DeepDiscoveryTrigger::new(
            service.id,
            Arc::clone(&store),
            TransactionPolicy::default(),
            guard,
            Arc::new(remote.clone()),
        );
        let report = trigger.trigger().await.unwrap();
        assert_eq!(
            report,
            DeepTriggerReport {
                queued: 1,
                launched: 1,
                withdrawn: 0,
            }
        );
        assert_eq!(remote.launched(), vec![free.id]);

        let snapshot = store.snapshot().await;
        assert_eq!(
            snapshot.entity(free.id).unwrap().metadata.deep_discovery_state,
            DeepDiscoveryState::Running
        );
        assert_eq!(
            snapshot.entity(allocated.id).unwrap().metadata.deep_discovery_state,
            DeepDiscoveryState::Initial
        );

        assert_eq!(trigger.trigger().await.unwrap(), DeepTriggerReport::default());
    }

    #[tokio::test]
    async fn queued_system_that_became_protected_is_never_launched() {
        let store = EntityStore::shared();
        let guard = Arc::new(StorageGuard::new().unwrap());
        let remote = FixtureRemote::new();
        let service = ExternalService::new(Uuid::new_v4(), "http://psme", ServiceType::PrimaryCompute);
        remote.add_service(FixtureServiceSpec::new(service.id, ServiceType::PrimaryCompute, "http://psme"));

        // Queued on an earlier tick, then found to host a storage service.
        let mut host = DiscoverableEntity::new(EntityKind::ComputerSystem, service.id, Some("/Systems/1".into()));
        host.metadata.deep_discovery_state = DeepDiscoveryState::WaitingToStart;
        host.metadata.storage_service_host = true;
        host.metadata.allocated = true;
        // Queued; its flags are not persisted yet.
        let mut guarded = DiscoverableEntity::new(EntityKind::ComputerSystem, service.id, Some("/Systems/2".into()));
        guarded.metadata.deep_discovery_state = DeepDiscoveryState::WaitingToStart;

        let tx = store.begin().await.unwrap();
        tx.save_service(service.clone()).await.unwrap();
        tx.save_entity(host.clone()).await.unwrap();
        tx.save_entity(guarded.clone()).await.unwrap();
        tx.commit().await.unwrap();

        // The guard learns about the second system from a view that already
        // carries the flag.
        let flagged_view = EntityStore::shared();
        let mut flagged = guarded.clone();
        flagged.metadata.storage_service_host = true;
        let tx = flagged_view.begin().await.unwrap();
        tx.save_entity(flagged).await.unwrap();
        tx.commit().await.unwrap();
        guard.load(&flagged_view.snapshot().await).await;
        assert!(guard.is_protected(guarded.id).await);

        let trigger = DeepDiscoveryTrigger::new(
            service.id,
            Arc::clone(&store),
            TransactionPolicy::default(),
            Arc::clone(&guard),
            Arc::new(remote.clone()),
        );
        let report = trigger.trigger().await.unwrap();
        assert_eq!(
            report,
            DeepTriggerReport {
                queued: 0,
                launched: 0,
                withdrawn: 2,
            }
        );
        assert!(remote.launched().is_empty());

        let snapshot = store.snapshot().await;
        for id in [host.id, guarded.id] {
            assert_eq!(
                snapshot.entity(id).unwrap().metadata.deep_discovery_state,
                DeepDiscoveryState::Initial
            );
        }
        assert_eq!(trigger.trigger().await.unwrap(), DeepTriggerReport::default());
    }
}
