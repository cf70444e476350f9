use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of management endpoint behind an external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// Compute sled / drawer controller.
    PrimaryCompute,
    /// Rack management module.
    RackManager,
    /// Storage service (iSCSI / NVMe-oF target host).
    Storage,
    /// Limited boot image used for deep discovery.
    LimitedImage,
    /// Fabric / switch management.
    Fabric,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::PrimaryCompute => "primary_compute",
            Self::RackManager => "rack_manager",
            Self::Storage => "storage",
            Self::LimitedImage => "limited_image",
            Self::Fabric => "fabric",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Enabled,
    Disabled,
    StandbyOffline,
    StandbySpare,
    InTest,
    Starting,
    Absent,
    UnavailableOffline,
    Deferring,
    Quiesced,
    Updating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Status {
    pub state: State,
    pub health: Option<Health>,
}

impl Status {
    pub const ABSENT: Status = Status {
        state: State::Absent,
        health: None,
    };

    pub const OFFLINE_CRITICAL: Status = Status {
        state: State::UnavailableOffline,
        health: Some(Health::Critical),
    };

    pub const ENABLED_OK: Status = Status {
        state: State::Enabled,
        health: Some(Health::Ok),
    };

    pub fn new(state: State, health: Option<Health>) -> Self {
        Self { state, health }
    }

    pub fn is_enabled_and_healthy(&self) -> bool {
        self.state == State::Enabled && self.health == Some(Health::Ok)
    }
}

/// How much of a remote resource gets copied into its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingDepth {
    Basic,
    Full,
    Deep,
}

impl MappingDepth {
    /// Mapping depth used for resources surfaced by a service of `service_type`.
    pub fn for_service(service_type: ServiceType, deep_discovery_enabled: bool) -> Self {
        match service_type {
            ServiceType::LimitedImage => MappingDepth::Deep,
            ServiceType::RackManager => MappingDepth::Full,
            _ if deep_discovery_enabled => MappingDepth::Basic,
            _ => MappingDepth::Full,
        }
    }
}

/// Deep discovery progress of a compute system.
///
/// ```text
/// Initial ──trigger──> WaitingToStart ──launch──> Running ──bootstrap mapped──> Done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeepDiscoveryState {
    #[default]
    Initial,
    WaitingToStart,
    Running,
    Done,
}

impl DeepDiscoveryState {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::WaitingToStart | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposedNodeState {
    Allocating,
    /// Resources reserved, assembly not confirmed yet.
    Allocated,
    Assembling,
    Assembled,
    Failed,
}

impl ComposedNodeState {
    /// States that only make sense while the composing process is alive.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Allocating | Self::Allocated | Self::Assembling)
    }
}

impl fmt::Display for ComposedNodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocating => write!(f, "ALLOCATING"),
            Self::Allocated => write!(f, "ALLOCATED"),
            Self::Assembling => write!(f, "ASSEMBLING"),
            Self::Assembled => write!(f, "ASSEMBLED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Persisted entity type a remote resource maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    ComputerSystem,
    Chassis,
    Manager,
    Processor,
    Memory,
    Drive,
    EthernetInterface,
    EthernetSwitch,
    EthernetSwitchPort,
    StorageService,
    Volume,
    Endpoint,
    Fabric,
}

impl EntityKind {
    pub const ALL: [EntityKind; 13] = [
        Self::ComputerSystem,
        Self::Chassis,
        Self::Manager,
        Self::Processor,
        Self::Memory,
        Self::Drive,
        Self::EthernetInterface,
        Self::EthernetSwitch,
        Self::EthernetSwitchPort,
        Self::StorageService,
        Self::Volume,
        Self::Endpoint,
        Self::Fabric,
    ];

    /// Resolves a remote resource type name (e.g. `#ComputerSystem.v1_4_0.ComputerSystem`
    /// or `ComputerSystem`) to the entity kind it maps onto.
    pub fn from_resource_type(resource_type: &str) -> Option<Self> {
        let base = resource_type
            .trim_start_matches('#')
            .split('.')
            .next()
            .unwrap_or_default();

        let kind = match base {
            "ComputerSystem" => Self::ComputerSystem,
            "Chassis" => Self::Chassis,
            "Manager" => Self::Manager,
            "Processor" => Self::Processor,
            "Memory" => Self::Memory,
            "Drive" => Self::Drive,
            "EthernetInterface" => Self::EthernetInterface,
            "EthernetSwitch" => Self::EthernetSwitch,
            "EthernetSwitchPort" => Self::EthernetSwitchPort,
            "StorageService" => Self::StorageService,
            "Volume" => Self::Volume,
            "Endpoint" => Self::Endpoint,
            "Fabric" => Self::Fabric,
            _ => return None,
        };
        Some(kind)
    }

    /// Property that identifies the same physical resource across services.
    pub fn identity_property(&self) -> Option<&'static str> {
        match self {
            Self::ComputerSystem => Some("uuid"),
            Self::EthernetInterface => Some("mac_address"),
            Self::Drive | Self::Memory | Self::Processor => Some("serial_number"),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
