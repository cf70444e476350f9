//! Storage guard: compute systems that host a storage service must never be
//! reclaimed, wiped or deep-discovered.
//!
//! A system is recognized by matching the storage service's hardware MAC
//! against the enabled, healthy network interfaces discovery knows about.

use crate::composition::ComposedNodeUpdater;
use crate::core::{DiscoveryError, EntityKind, Result, ServiceType};
use crate::mapping::DiscoveryFinalizer;
use crate::model::{DiscoverableEntity, ExternalService, normalize_identity};
use crate::storage::{StoreState, StoreTx};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

const MAC_PATTERN: &str = r"^(?i)[0-9a-f]{2}([:-]?[0-9a-f]{2}){5}$";

pub struct StorageGuard {
    protected: RwLock<HashSet<Uuid>>,
    mac_format: Regex,
}

impl StorageGuard {
    pub fn new() -> Result<Self> {
        let mac_format = Regex::new(MAC_PATTERN)
            .map_err(|err| DiscoveryError::Configuration(format!("invalid MAC pattern: {err}")))?;
        Ok(Self {
            protected: RwLock::new(HashSet::new()),
            mac_format,
        })
    }

    /// Canonical form of a MAC address, `None` if it is not one.
    pub fn normalize_mac(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        self.mac_format
            .is_match(trimmed)
            .then(|| normalize_identity(trimmed))
    }

    pub async fn is_protected(&self, system_id: Uuid) -> bool {
        self.protected.read().await.contains(&system_id)
    }

    pub async fn protected_systems(&self) -> Vec<Uuid> {
        let mut systems: Vec<Uuid> = self.protected.read().await.iter().copied().collect();
        systems.sort();
        systems
    }

    pub async fn release(&self, system_id: Uuid) -> bool {
        self.protected.write().await.remove(&system_id)
    }

    /// Rebuilds the in-memory set from persisted flags (startup).
    pub async fn load(&self, state: &StoreState) -> usize {
        let hosts: HashSet<Uuid> = state
            .entities_where(|entity| {
                entity.kind == EntityKind::ComputerSystem && entity.metadata.storage_service_host
            })
            .into_iter()
            .map(|entity| entity.id)
            .collect();
        let count = hosts.len();
        *self.protected.write().await = hosts;
        count
    }

    /// Marks every compute system whose healthy NIC carries the storage
    /// service's MAC as storage host + allocated. Returns the systems found.
    pub async fn protect_storage_hosts(&self, tx: &StoreTx, service: &ExternalService) -> Result<Vec<Uuid>> {
        let Some(mac) = service
            .mac_address
            .as_deref()
            .and_then(|raw| self.normalize_mac(raw))
        else {
            debug!(service_id = %service.id, "storage service has no usable MAC address");
            return Ok(Vec::new());
        };

        let interfaces = tx
            .entities_where(|entity| {
                entity.kind == EntityKind::EthernetInterface
                    && entity.is_enabled_and_healthy()
                    && entity.identity_key().as_deref() == Some(mac.as_str())
            })
            .await?;

        let mut hosts = Vec::new();
        for interface in interfaces {
            for system in self.owning_systems(tx, &interface).await? {
                if !hosts.contains(&system.id) {
                    hosts.push(system.id);
                    self.mark_host(tx, system).await?;
                }
            }
        }

        if !hosts.is_empty() {
            let mut protected = self.protected.write().await;
            protected.extend(hosts.iter().copied());
        }
        Ok(hosts)
    }

    async fn owning_systems(&self, tx: &StoreTx, interface: &DiscoverableEntity) -> Result<Vec<DiscoverableEntity>> {
        let mut systems = Vec::new();
        for link in tx.links_of(interface.id).await? {
            let other = if link.source == interface.id { link.target } else { link.source };
            if let Some(entity) = tx.entity(other).await?
                && entity.kind == EntityKind::ComputerSystem
            {
                systems.push(entity);
            }
        }
        Ok(systems)
    }

    async fn mark_host(&self, tx: &StoreTx, mut system: DiscoverableEntity) -> Result<()> {
        if system.metadata.storage_service_host && system.metadata.allocated {
            return Ok(());
        }
        system.metadata.storage_service_host = true;
        system.metadata.allocated = true;
        info!(system_id = %system.id, "compute system hosts a storage service, protected");
        tx.save_entity(system).await
    }
}

/// Finalizer for storage services: protect hosts, then re-evaluate
/// composed nodes using the service's assets.
pub struct StorageServiceFinalizer {
    guard: Arc<StorageGuard>,
    nodes: ComposedNodeUpdater,
}

impl StorageServiceFinalizer {
    pub fn new(guard: Arc<StorageGuard>) -> Self {
        Self {
            guard,
            nodes: ComposedNodeUpdater::new(),
        }
    }
}

#[async_trait]
impl DiscoveryFinalizer for StorageServiceFinalizer {
    fn name(&self) -> &'static str {
        "storage_service_finalizer"
    }

    fn applies_to(&self, service_type: ServiceType) -> bool {
        service_type == ServiceType::Storage
    }

    async fn finalize(
        &self,
        tx: &StoreTx,
        entities: &[DiscoverableEntity],
        service: &ExternalService,
    ) -> Result<()> {
        self.guard.protect_storage_hosts(tx, service).await?;
        self.nodes.update_related(tx, entities).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Status;
    use crate::model::EntityLink;
    use crate::storage::EntityStore;
    use serde_json::json;

    #[test]
    fn mac_normalization() {
        let guard = StorageGuard::new().unwrap();
        assert_eq!(guard.normalize_mac("AA:BB:CC:DD:EE:01").as_deref(), Some("aabbccddee01"));
        assert_eq!(guard.normalize_mac("aa-bb-cc-dd-ee-01").as_deref(), Some("aabbccddee01"));
        assert_eq!(guard.normalize_mac("aabbccddee01").as_deref(), Some("aabbccddee01"));
        assert!(guard.normalize_mac("not-a-mac").is_none());
    }

    #[tokio::test]
    async fn storage_host_is_marked_and_protected() {
        let store = EntityStore::shared();
        let guard = StorageGuard::new().unwrap();
        let compute = Uuid::new_v4();
        let storage = ExternalService::new(Uuid::new_v4(), "http://rss", ServiceType::Storage)
            .with_mac_address("AA:BB:CC:DD:EE:01");

        let system = DiscoverableEntity::new(EntityKind::ComputerSystem, compute, Some("/Systems/1".into()));
        let mut nic = DiscoverableEntity::new(EntityKind::EthernetInterface, compute, Some("/Systems/1/Eth/1".into()));
        nic.status = Some(Status::ENABLED_OK);
        nic.set_property("mac_address", json!("aa:bb:cc:dd:ee:01"));

        let tx = store.begin().await.unwrap();
        tx.save_entity(system.clone()).await.unwrap();
        tx.save_entity(nic.clone()).await.unwrap();
        tx.add_link(EntityLink::new(system.id, nic.id, "ethernet_interfaces")).await.unwrap();

        let hosts = guard.protect_storage_hosts(&tx, &storage).await.unwrap();
        assert_eq!(hosts, vec![system.id]);
        assert!(guard.is_protected(system.id).await);

        let stored = tx.entity(system.id).await.unwrap().unwrap();
        assert!(stored.metadata.storage_service_host);
        assert!(stored.metadata.allocated);
        tx.commit().await.unwrap();

        let fresh = StorageGuard::new().unwrap();
        assert_eq!(fresh.load(&store.snapshot().await).await, 1);
        assert!(fresh.is_protected(system.id).await);
    }

    #[tokio::test]
    async fn unhealthy_interface_does_not_protect() {
        let store = EntityStore::shared();
        let guard = StorageGuard::new().unwrap();
        let storage = ExternalService::new(Uuid::new_v4(), "http://rss", ServiceType::Storage)
            .with_mac_address("aa:bb:cc:dd:ee:02");
        let mut nic = DiscoverableEntity::new(EntityKind::EthernetInterface, Uuid::new_v4(), None);
        nic.status = Some(Status::OFFLINE_CRITICAL);
        nic.set_property("mac_address", json!("aa:bb:cc:dd:ee:02"));

        let tx = store.begin().await.unwrap();
        tx.save_entity(nic).await.unwrap();
        assert!(guard.protect_storage_hosts(&tx, &storage).await.unwrap().is_empty());
    }
}
