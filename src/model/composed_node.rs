use crate::core::{ComposedNodeState, Status};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Logical system assembled from discovered hardware.
///
/// Owned by the composition subsystem; discovery only re-evaluates it when
/// the entities it references change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedNode {
    pub id: Uuid,
    pub name: String,
    pub state: ComposedNodeState,
    pub status: Option<Status>,
    pub computer_system: Option<Uuid>,
    /// Drives, volumes and endpoints attached to the node.
    pub assets: BTreeSet<Uuid>,
    /// Hardware UUID of the compute system the node was assembled on.
    pub associated_system_uuid: Option<Uuid>,
    pub associated_compute_service: Option<Uuid>,
    /// Storage service exposing the node's remote target.
    #[serde(default)]
    pub associated_storage_service: Option<Uuid>,
    /// IQN of the remote target (volume) the node boots from.
    #[serde(default)]
    pub associated_remote_target_iqn: Option<String>,
    /// Local drives the node was composed with.
    #[serde(default)]
    pub requested_drives: usize,
    /// Node lost its hardware while assembled and may be recovered when it returns.
    pub eligible_for_recovery: bool,
}

impl ComposedNode {
    pub fn new(name: impl Into<String>, state: ComposedNodeState) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state,
            status: None,
            computer_system: None,
            assets: BTreeSet::new(),
            associated_system_uuid: None,
            associated_compute_service: None,
            associated_storage_service: None,
            associated_remote_target_iqn: None,
            requested_drives: 0,
            eligible_for_recovery: false,
        }
    }

    /// The node was composed with a remote target it must get back.
    pub fn expects_remote_target(&self) -> bool {
        self.associated_storage_service.is_some() && self.associated_remote_target_iqn.is_some()
    }

    pub fn references(&self, entity_id: Uuid) -> bool {
        self.computer_system == Some(entity_id) || self.assets.contains(&entity_id)
    }

    pub fn referenced_entities(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.computer_system.iter().copied().chain(self.assets.iter().copied())
    }

    /// Moves the node to `Failed`, remembering whether it can be recovered.
    pub fn disable(&mut self) {
        if self.state == ComposedNodeState::Assembled {
            self.eligible_for_recovery = true;
        }
        self.state = ComposedNodeState::Failed;
        self.status = Some(Status::OFFLINE_CRITICAL);
    }

    /// Drops a reference to an entity that no longer exists.
    pub fn detach(&mut self, entity_id: Uuid) {
        if self.computer_system == Some(entity_id) {
            self.computer_system = None;
        }
        self.assets.remove(&entity_id);
    }
}
