//! Keeps composed nodes consistent with the hardware discovery reports.
//!
//! Nodes whose assets stop being usable are failed (and remembered as
//! recoverable when they were assembled); recoverable nodes get their
//! compute system, remote target and drives back once they reappear
//! healthy.

use crate::core::{
    ComposedNodeState, DiscoveryError, EntityKind, Health, Result, ServiceType, State, Status,
};
use crate::health::ServiceUnreachableHook;
use crate::mapping::{DiscoveryFinalizer, EntityRemovalListener};
use crate::model::{ComposedNode, DiscoverableEntity, ExternalService};
use crate::storage::StoreTx;
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{error, info, trace};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct ComposedNodeUpdater;

impl ComposedNodeUpdater {
    pub fn new() -> Self {
        Self
    }

    /// Re-evaluates composed nodes against entities touched by a pass.
    pub async fn update_related(&self, tx: &StoreTx, entities: &[DiscoverableEntity]) -> Result<()> {
        let usable: Vec<&DiscoverableEntity> = entities
            .iter()
            .filter(|entity| entity.is_enabled_and_healthy())
            .collect();
        self.reattach(tx, &usable).await?;

        let not_enabled: HashSet<Uuid> = entities
            .iter()
            .filter(|entity| is_asset_not_enabled(entity))
            .inspect(|entity| trace!(entity_id = %entity.id, "not enabled asset"))
            .map(|entity| entity.id)
            .collect();
        self.disable_referencing(tx, &not_enabled).await?;
        Ok(())
    }

    async fn reattach(&self, tx: &StoreTx, usable: &[&DiscoverableEntity]) -> Result<()> {
        let recoverable: Vec<ComposedNode> = tx
            .composed_nodes()
            .await?
            .into_iter()
            .filter(|node| node.eligible_for_recovery)
            .collect();

        for mut node in recoverable {
            let original = node.clone();
            self.reattach_computer_system(tx, &mut node, usable).await?;
            self.reattach_remote_target(tx, &mut node, usable).await?;
            self.reattach_drives(tx, &mut node, usable).await?;

            if self.fulfills_requirements(tx, &node).await? {
                node.eligible_for_recovery = false;
                node.state = ComposedNodeState::Assembled;
                node.status = Some(Status::ENABLED_OK);
                info!(node_id = %node.id, state = %node.state, "composed node recovered");
            }
            if node != original {
                tx.save_composed_node(node).await?;
            }
        }
        Ok(())
    }

    /// Matched by hardware UUID within the compute service the node was
    /// assembled on.
    async fn reattach_computer_system(
        &self,
        tx: &StoreTx,
        node: &mut ComposedNode,
        usable: &[&DiscoverableEntity],
    ) -> Result<()> {
        let (Some(system_uuid), Some(compute_service)) = (node.associated_system_uuid, node.associated_compute_service)
        else {
            return Ok(());
        };
        let matches: Vec<Uuid> = usable
            .iter()
            .filter(|entity| entity.kind == EntityKind::ComputerSystem)
            .filter(|entity| entity.service_id == compute_service)
            .filter(|entity| entity.system_uuid() == Some(system_uuid))
            .map(|entity| entity.id)
            .collect();

        match matches.as_slice() {
            [] => {}
            [system_id] => {
                allocate(tx, *system_id).await?;
                node.computer_system = Some(*system_id);
            }
            _ => error!(
                %system_uuid,
                %compute_service,
                "more than one computer system with the same uuid in service"
            ),
        }
        Ok(())
    }

    /// Matched by target IQN within the storage service the node was
    /// assembled with.
    async fn reattach_remote_target(
        &self,
        tx: &StoreTx,
        node: &mut ComposedNode,
        usable: &[&DiscoverableEntity],
    ) -> Result<()> {
        let (Some(storage_service), Some(iqn)) =
            (node.associated_storage_service, node.associated_remote_target_iqn.as_deref())
        else {
            return Ok(());
        };
        let matches: Vec<Uuid> = usable
            .iter()
            .filter(|entity| entity.kind == EntityKind::Volume)
            .filter(|entity| entity.service_id == storage_service)
            .filter(|entity| entity.target_iqn() == Some(iqn))
            .map(|entity| entity.id)
            .collect();

        match matches.as_slice() {
            [] => {}
            [volume_id] => {
                allocate(tx, *volume_id).await?;
                node.assets.insert(*volume_id);
            }
            _ => error!(
                %iqn,
                %storage_service,
                "more than one remote target with the same iqn in service"
            ),
        }
        Ok(())
    }

    /// Drives behind an endpoint that share a PCIe cable with the node's
    /// compute system.
    async fn reattach_drives(
        &self,
        tx: &StoreTx,
        node: &mut ComposedNode,
        usable: &[&DiscoverableEntity],
    ) -> Result<()> {
        let Some(system_id) = node.computer_system else {
            return Ok(());
        };
        let Some(system) = tx.entity(system_id).await? else {
            return Ok(());
        };
        let cables: HashSet<&str> = system.pcie_connection_ids().into_iter().collect();
        if cables.is_empty() {
            return Ok(());
        }

        for drive in usable.iter().filter(|entity| entity.kind == EntityKind::Drive) {
            if node.assets.contains(&drive.id)
                || !drive.pcie_connection_ids().iter().any(|cable| cables.contains(cable))
                || !self.connected_to_endpoint(tx, drive.id).await?
            {
                continue;
            }
            trace!(drive_id = %drive.id, node_id = %node.id, "reattaching drive");
            allocate(tx, drive.id).await?;
            node.assets.insert(drive.id);
        }
        Ok(())
    }

    async fn connected_to_endpoint(&self, tx: &StoreTx, entity_id: Uuid) -> Result<bool> {
        for link in tx.links_of(entity_id).await? {
            let other = if link.source == entity_id { link.target } else { link.source };
            if let Some(entity) = tx.entity(other).await?
                && entity.kind == EntityKind::Endpoint
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The compute system, the remote target (when the node had one) and the
    /// requested number of drives must all be back, and every referenced
    /// entity must be enabled and healthy.
    async fn fulfills_requirements(&self, tx: &StoreTx, node: &ComposedNode) -> Result<bool> {
        if node.computer_system.is_none() {
            return Ok(false);
        }
        let mut remote_targets = 0;
        let mut drives = 0;
        for id in node.referenced_entities() {
            match tx.entity(id).await? {
                Some(entity) if entity.is_enabled_and_healthy() => match entity.kind {
                    EntityKind::Volume => remote_targets += 1,
                    EntityKind::Drive => drives += 1,
                    _ => {}
                },
                _ => return Ok(false),
            }
        }
        if node.expects_remote_target() && remote_targets == 0 {
            return Ok(false);
        }
        Ok(drives == node.requested_drives)
    }

    async fn disable_referencing(&self, tx: &StoreTx, assets: &HashSet<Uuid>) -> Result<usize> {
        if assets.is_empty() {
            return Ok(0);
        }
        let mut disabled = 0;
        for mut node in tx.composed_nodes().await? {
            if node.state == ComposedNodeState::Failed {
                continue;
            }
            if node.referenced_entities().any(|id| assets.contains(&id)) {
                self.disable(&mut node);
                tx.save_composed_node(node).await?;
                disabled += 1;
            }
        }
        Ok(disabled)
    }

    pub fn disable(&self, node: &mut ComposedNode) {
        node.disable();
        info!(
            node_id = %node.id,
            state = %node.state,
            "composed node disabled"
        );
    }
}

/// Not enabled: no status, a state other than Enabled/StandbyOffline, or
/// critical health.
pub fn is_asset_not_enabled(entity: &DiscoverableEntity) -> bool {
    match entity.status {
        None => true,
        Some(status) => {
            !matches!(status.state, State::Enabled | State::StandbyOffline)
                || status.health == Some(Health::Critical)
        }
    }
}

#[async_trait]
impl DiscoveryFinalizer for ComposedNodeUpdater {
    fn name(&self) -> &'static str {
        "composed_node_updater"
    }

    fn applies_to(&self, service_type: ServiceType) -> bool {
        service_type == ServiceType::PrimaryCompute
    }

    async fn finalize(
        &self,
        tx: &StoreTx,
        entities: &[DiscoverableEntity],
        _service: &ExternalService,
    ) -> Result<()> {
        self.update_related(tx, entities).await
    }
}

#[async_trait]
impl EntityRemovalListener for ComposedNodeUpdater {
    async fn on_entities_removed(&self, tx: &StoreTx, removed: &[DiscoverableEntity]) -> Result<()> {
        let ids: HashSet<Uuid> = removed.iter().map(|entity| entity.id).collect();
        for mut node in tx.composed_nodes().await? {
            if !node.referenced_entities().any(|id| ids.contains(&id)) {
                continue;
            }
            for id in &ids {
                node.detach(*id);
            }
            if node.state != ComposedNodeState::Failed {
                self.disable(&mut node);
            }
            tx.save_composed_node(node).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceUnreachableHook for ComposedNodeUpdater {
    async fn on_unreachable(&self, tx: &StoreTx, service: &ExternalService) -> Result<()> {
        let owned: HashSet<Uuid> = tx
            .entities_of_service(service.id)
            .await?
            .into_iter()
            .map(|entity| entity.id)
            .collect();
        let disabled = self.disable_referencing(tx, &owned).await?;
        if disabled > 0 {
            info!(service_id = %service.id, disabled, "composed nodes disabled after service became unreachable");
        }
        Ok(())
    }
}

async fn allocate(tx: &StoreTx, entity_id: Uuid) -> Result<()> {
    if let Some(mut entity) = tx.entity(entity_id).await?
        && !entity.metadata.allocated
    {
        entity.metadata.allocated = true;
        tx.save_entity(entity).await?;
    }
    Ok(())
}

/// Looks up a composed node or fails with `NotFound`.
pub async fn require_node(tx: &StoreTx, id: Uuid) -> Result<ComposedNode> {
    tx.composed_node(id)
        .await?
        .ok_or_else(|| DiscoveryError::NotFound(format!("composed node {id}")))
}
