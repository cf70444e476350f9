use crate::core::{DeepDiscoveryState, EntityKind, Status};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Bookkeeping that belongs to this system, never copied from remote data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    /// Reserved by a composed node (or protected by the storage guard).
    pub allocated: bool,
    /// Compute system hosts a storage service and must not be reclaimed.
    pub storage_service_host: bool,
    /// Only meaningful for compute systems.
    pub deep_discovery_state: DeepDiscoveryState,
    /// Deep mapping has populated this entity at least once.
    pub deep_discovered: bool,
}

/// A persisted object sourced from an external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverableEntity {
    pub id: Uuid,
    pub kind: EntityKind,
    pub service_id: Uuid,
    /// `None` for entities created by actions rather than discovery.
    pub source_uri: Option<String>,
    /// Last touched by discovery. Entities without this flag are never
    /// treated as stale.
    pub discovered: bool,
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<Status>,
    /// Remote fields copied by mappers, snake_case keys.
    pub properties: Map<String, Value>,
    pub metadata: EntityMetadata,
}

impl DiscoverableEntity {
    pub fn new(kind: EntityKind, service_id: Uuid, source_uri: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            service_id,
            source_uri,
            discovered: false,
            name: None,
            description: None,
            status: None,
            properties: Map::new(),
            metadata: EntityMetadata::default(),
        }
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: Value) {
        self.properties.insert(key.into(), value);
    }

    pub fn is_enabled_and_healthy(&self) -> bool {
        self.status
            .map(|status| status.is_enabled_and_healthy())
            .unwrap_or(false)
    }

    /// Hardware UUID reported by a compute system.
    pub fn system_uuid(&self) -> Option<Uuid> {
        self.property_str("uuid")
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }

    /// iSCSI qualified name a volume is exported under.
    pub fn target_iqn(&self) -> Option<&str> {
        self.property_str("target_iqn")
    }

    /// PCIe cable ids a compute system or drive is attached through.
    pub fn pcie_connection_ids(&self) -> Vec<&str> {
        self.properties
            .get("pcie_connection_ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn is_rack_chassis(&self) -> bool {
        self.kind == EntityKind::Chassis
            && self
                .property_str("chassis_type")
                .map(|chassis_type| chassis_type.eq_ignore_ascii_case("rack"))
                .unwrap_or(false)
    }

    /// Value of the cross-service identity property for this kind, if any.
    pub fn identity_key(&self) -> Option<String> {
        let property = self.kind.identity_property()?;
        self.property_str(property).map(normalize_identity)
    }
}

/// Identity values compare case-insensitively and without separators
/// (`AA:BB:...` and `aa-bb-...` are the same MAC).
pub fn normalize_identity(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}
