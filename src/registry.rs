//! Service registry: CRUD over known external services.

use crate::core::{DiscoveryError, Result};
use crate::model::{ExternalService, ServiceEndpoint};
use crate::storage::StoreTx;
use tracing::info;
use uuid::Uuid;

/// Outcome of registering a detected endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// Known service seen at a new address (or back from unreachable).
    Updated,
    Unchanged,
}

/// Stateless facade over the service table of a transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceRegistry;

impl ServiceRegistry {
    pub fn new() -> Self {
        Self
    }

    pub async fn find(&self, tx: &StoreTx, id: Uuid) -> Result<Option<ExternalService>> {
        tx.service(id).await
    }

    pub async fn get(&self, tx: &StoreTx, id: Uuid) -> Result<ExternalService> {
        self.find(tx, id)
            .await?
            .ok_or_else(|| DiscoveryError::NotFound(format!("service {id}")))
    }

    pub async fn all(&self, tx: &StoreTx) -> Result<Vec<ExternalService>> {
        let mut services = tx.services().await?;
        services.sort_by_key(|service| service.created_at);
        Ok(services)
    }

    pub async fn save(&self, tx: &StoreTx, service: ExternalService) -> Result<()> {
        tx.save_service(service).await
    }

    /// Creates the service on first detection; updates its address when it
    /// shows up somewhere else. Identity is the only key.
    pub async fn register_or_update(
        &self,
        tx: &StoreTx,
        endpoint: &ServiceEndpoint,
    ) -> Result<(ExternalService, Registration)> {
        match tx.service(endpoint.id).await? {
            None => {
                let mut service =
                    ExternalService::new(endpoint.id, endpoint.base_uri.clone(), endpoint.service_type);
                service.mac_address = endpoint.mac_address.clone();
                tx.save_service(service.clone()).await?;
                info!(service_id = %service.id, uri = %service.base_uri, service_type = %service.service_type, "registered new service");
                Ok((service, Registration::Created))
            }
            Some(mut service) => {
                let mut changed = false;
                if service.base_uri != endpoint.base_uri {
                    info!(service_id = %service.id, from = %service.base_uri, to = %endpoint.base_uri, "service moved");
                    service.base_uri = endpoint.base_uri.clone();
                    changed = true;
                }
                if endpoint.mac_address.is_some() && service.mac_address != endpoint.mac_address {
                    service.mac_address = endpoint.mac_address.clone();
                    changed = true;
                }
                if !service.reachable {
                    service.mark_reachable();
                    changed = true;
                }
                if !changed {
                    return Ok((service, Registration::Unchanged));
                }
                tx.save_service(service.clone()).await?;
                Ok((service, Registration::Updated))
            }
        }
    }

    /// Sets the re-scan flag. Returns `false` if the service is unknown.
    pub async fn mark_dirty(&self, tx: &StoreTx, id: Uuid, dirty: bool) -> Result<bool> {
        let Some(mut service) = tx.service(id).await? else {
            return Ok(false);
        };
        if service.dirty != dirty {
            service.dirty = dirty;
            tx.save_service(service).await?;
        }
        Ok(true)
    }

    /// Deletes the service along with every entity it owns (and their links).
    pub async fn remove(&self, tx: &StoreTx, id: Uuid) -> Result<Vec<Uuid>> {
        let owned = tx.entities_of_service(id).await?;
        let mut removed = Vec::with_capacity(owned.len());
        for entity in owned {
            if tx.delete_entity(entity.id).await?.is_some() {
                removed.push(entity.id);
            }
        }
        tx.delete_service(id).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EntityKind, ServiceType};
    use crate::model::DiscoverableEntity;
    use crate::storage::EntityStore;

    #[tokio::test]
    async fn register_is_keyed_by_identity() {
        let store = EntityStore::shared();
        let registry = ServiceRegistry::new();
        let id = Uuid::new_v4();

        let tx = store.begin().await.unwrap();
        let endpoint = ServiceEndpoint::new(ServiceType::Storage, id, "http://10.0.0.5:8443");
        let (_, outcome) = registry.register_or_update(&tx, &endpoint).await.unwrap();
        assert_eq!(outcome, Registration::Created);

        let (_, outcome) = registry.register_or_update(&tx, &endpoint).await.unwrap();
        assert_eq!(outcome, Registration::Unchanged);

        let moved = ServiceEndpoint::new(ServiceType::Storage, id, "http://10.0.0.6:8443");
        let (service, outcome) = registry.register_or_update(&tx, &moved).await.unwrap();
        assert_eq!(outcome, Registration::Updated);
        assert_eq!(service.base_uri, "http://10.0.0.6:8443");
        assert_eq!(registry.all(&tx).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_cascades_to_owned_entities() {
        let store = EntityStore::shared();
        let registry = ServiceRegistry::new();
        let service = ExternalService::new(Uuid::new_v4(), "http://rmm", ServiceType::RackManager);
        let other = Uuid::new_v4();

        let tx = store.begin().await.unwrap();
        registry.save(&tx, service.clone()).await.unwrap();
        tx.save_entity(DiscoverableEntity::new(EntityKind::Chassis, service.id, Some("/Chassis/Rack".into())))
            .await
            .unwrap();
        tx.save_entity(DiscoverableEntity::new(EntityKind::Chassis, other, Some("/Chassis/Rack".into())))
            .await
            .unwrap();

        let removed = registry.remove(&tx, service.id).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(registry.find(&tx, service.id).await.unwrap().is_none());
        assert_eq!(tx.entities_of_service(other).await.unwrap().len(), 1);
    }
}
