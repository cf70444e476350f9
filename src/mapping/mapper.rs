use crate::core::{EntityKind, Health, MappingDepth, Result, State, Status};
use crate::graph::Resource;
use crate::model::DiscoverableEntity;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// Copies a remote resource into the entity it maps onto.
pub trait EntityMapper: Send + Sync {
    fn name(&self) -> &'static str;

    fn target_kind(&self) -> EntityKind;

    fn depth(&self) -> MappingDepth;

    fn map(&self, resource: &Resource, entity: &mut DiscoverableEntity) -> Result<()>;
}

/// Fields a basic pass keeps current: what identifies a resource and
/// whether it is usable.
const BASIC_FIELDS: &[&str] = &[
    "uuid",
    "mac_address",
    "serial_number",
    "chassis_type",
    "asset_tag",
    "power_state",
];

/// Generic property-copying mapper.
///
/// `name`, `description` and `status` land on dedicated fields; everything
/// else goes into the property bag. Basic merges only identity fields, Full
/// and Deep replace the bag with the remote view.
#[derive(Debug, Clone, Copy)]
pub struct PropertyMapper {
    kind: EntityKind,
    depth: MappingDepth,
}

impl PropertyMapper {
    pub fn new(kind: EntityKind, depth: MappingDepth) -> Self {
        Self { kind, depth }
    }
}

impl EntityMapper for PropertyMapper {
    fn name(&self) -> &'static str {
        match self.depth {
            MappingDepth::Basic => "basic_property_mapper",
            MappingDepth::Full => "full_property_mapper",
            MappingDepth::Deep => "deep_property_mapper",
        }
    }

    fn target_kind(&self) -> EntityKind {
        self.kind
    }

    fn depth(&self) -> MappingDepth {
        self.depth
    }

    fn map(&self, resource: &Resource, entity: &mut DiscoverableEntity) -> Result<()> {
        let remote = &resource.properties;

        if let Some(name) = remote.get("name").and_then(Value::as_str) {
            entity.name = Some(name.to_string());
        }
        if let Some(description) = remote.get("description").and_then(Value::as_str) {
            entity.description = Some(description.to_string());
        }
        entity.status = remote.get("status").and_then(parse_status);

        match self.depth {
            MappingDepth::Basic => {
                for field in BASIC_FIELDS {
                    if let Some(value) = remote.get(*field) {
                        entity.set_property(*field, value.clone());
                    }
                }
            }
            MappingDepth::Full | MappingDepth::Deep => {
                entity.properties = bag_without_dedicated_fields(remote);
                if self.depth == MappingDepth::Deep {
                    entity.metadata.deep_discovered = true;
                }
            }
        }
        Ok(())
    }
}

fn bag_without_dedicated_fields(remote: &Map<String, Value>) -> Map<String, Value> {
    remote
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "name" | "description" | "status"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Accepts `{"state": "Enabled", "health": "OK"}` in any letter case, with
/// or without separators.
pub fn parse_status(value: &Value) -> Option<Status> {
    let state = value.get("state").and_then(Value::as_str).and_then(parse_state)?;
    let health = value.get("health").and_then(Value::as_str).and_then(parse_health);
    Some(Status::new(state, health))
}

fn squash(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn parse_state(raw: &str) -> Option<State> {
    let state = match squash(raw).as_str() {
        "enabled" => State::Enabled,
        "disabled" => State::Disabled,
        "standbyoffline" => State::StandbyOffline,
        "standbyspare" => State::StandbySpare,
        "intest" => State::InTest,
        "starting" => State::Starting,
        "absent" => State::Absent,
        "unavailableoffline" => State::UnavailableOffline,
        "deferring" => State::Deferring,
        "quiesced" => State::Quiesced,
        "updating" => State::Updating,
        _ => return None,
    };
    Some(state)
}

fn parse_health(raw: &str) -> Option<Health> {
    match squash(raw).as_str() {
        "ok" => Some(Health::Ok),
        "warning" => Some(Health::Warning),
        "critical" => Some(Health::Critical),
        _ => None,
    }
}

/// Explicit (entity kind, depth) -> mapper table.
pub struct MapperRegistry {
    mappers: HashMap<(EntityKind, MappingDepth), Box<dyn EntityMapper>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self {
            mappers: HashMap::new(),
        }
    }

    /// Replaces any mapper already registered for the same kind and depth.
    pub fn register(&mut self, mapper: Box<dyn EntityMapper>) {
        debug!(
            mapper = mapper.name(),
            kind = %mapper.target_kind(),
            depth = ?mapper.depth(),
            "registered entity mapper"
        );
        self.mappers
            .insert((mapper.target_kind(), mapper.depth()), mapper);
    }

    /// Property mappers for every known kind at every depth.
    pub fn with_default_mappers() -> Self {
        let mut registry = Self::new();
        for kind in EntityKind::ALL {
            for depth in [MappingDepth::Basic, MappingDepth::Full, MappingDepth::Deep] {
                registry.register(Box::new(PropertyMapper::new(kind, depth)));
            }
        }
        registry
    }

    /// Zero or one mapper for the remote type at the given depth.
    pub fn find_mapper(&self, resource_type: &str, depth: MappingDepth) -> Option<&dyn EntityMapper> {
        let kind = EntityKind::from_resource_type(resource_type)?;
        self.mappers.get(&(kind, depth)).map(|boxed| &**boxed)
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}

impl Default for MapperRegistry {
    fn default() -> Self {
        Self::with_default_mappers()
    }
}
