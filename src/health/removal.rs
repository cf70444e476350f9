use super::ServiceHealthManager;
use crate::core::{DiscoveryError, Result};
use crate::guard::StorageGuard;
use crate::mapping::EntityRemovalListener;
use crate::registry::ServiceRegistry;
use crate::storage::{EntityStore, StoreTx};
use crate::transaction::{TransactionPolicy, run_in_transaction};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Evicts services that stayed unreachable past the grace period.
pub struct ServiceRemovalTask {
    store: Arc<EntityStore>,
    policy: TransactionPolicy,
    health: Arc<ServiceHealthManager>,
    guard: Arc<StorageGuard>,
    registry: ServiceRegistry,
    listeners: Vec<Arc<dyn EntityRemovalListener>>,
    grace: chrono::Duration,
}

impl ServiceRemovalTask {
    pub fn new(
        store: Arc<EntityStore>,
        policy: TransactionPolicy,
        health: Arc<ServiceHealthManager>,
        guard: Arc<StorageGuard>,
        grace: Duration,
    ) -> Result<Self> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|err| DiscoveryError::Configuration(format!("service removal delay: {err}")))?;
        Ok(Self {
            store,
            policy,
            health,
            guard,
            registry: ServiceRegistry::new(),
            listeners: Vec::new(),
            grace,
        })
    }

    pub fn with_removal_listener(mut self, listener: Arc<dyn EntityRemovalListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// One sweep. Returns the evicted service ids.
    pub async fn run_once(&self) -> Result<Vec<Uuid>> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let candidates: Vec<Uuid> = self
            .store
            .snapshot()
            .await
            .services()
            .into_iter()
            .filter(|service| service.is_evictable(now, self.grace))
            .map(|service| service.id)
            .collect();

        let mut evicted = Vec::new();
        for service_id in candidates {
            match self.evict(service_id, now).await {
                Ok(true) => evicted.push(service_id),
                Ok(false) => {}
                Err(err) => warn!(%service_id, error = %err, "failed to evict unreachable service"),
            }
        }
        if !evicted.is_empty() {
            self.store.vacuum().await?;
        }
        Ok(evicted)
    }

    async fn evict(&self, service_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let removed = run_in_transaction(&self.store, &self.policy, move |tx| {
            self.evict_once(tx, service_id, now)
        })
        .await?;

        let Some(removed) = removed else {
            debug!(%service_id, "service recovered before eviction, kept");
            return Ok(false);
        };
        // Only once the eviction committed: a recovered service keeps its tasks.
        self.health.unregister(service_id).await;
        for id in &removed {
            self.guard.release(*id).await;
        }
        info!(%service_id, entities = removed.len(), "unreachable service removed");
        Ok(true)
    }

    async fn evict_once(&self, tx: StoreTx, service_id: Uuid, now: DateTime<Utc>) -> Result<Option<Vec<Uuid>>> {
        // Recovered (or already gone) since the sweep started.
        match tx.service(service_id).await? {
            Some(service) if service.is_evictable(now, self.grace) => {}
            _ => return Ok(None),
        }

        let owned = tx.entities_of_service(service_id).await?;
        let removed = self.registry.remove(&tx, service_id).await?;
        for listener in &self.listeners {
            listener.on_entities_removed(&tx, &owned).await?;
        }
        Ok(Some(removed))
    }
}

/// Background sweeper. Dropping it aborts the loop; `stop` lets the
/// current sweep finish.
pub struct ServiceRemovalWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ServiceRemovalWorker {
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| DiscoveryError::Storage(format!("removal worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for ServiceRemovalWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

pub fn spawn_service_removal_worker(task: Arc<ServiceRemovalTask>, interval: Duration) -> ServiceRemovalWorker {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let interval = interval.max(Duration::from_millis(10));

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    match task.run_once().await {
                        Ok(evicted) if !evicted.is_empty() => debug!(count = evicted.len(), "removal sweep evicted services"),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "service removal sweep failed"),
                    }
                }
            }
        }
    });

    ServiceRemovalWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
