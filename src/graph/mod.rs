// ============================================================================
// Resource Graph
// ============================================================================
//
// One fetched snapshot of a service's remote inventory. Built by the remote
// graph builder, consumed by the graph mapper, then dropped.
//
// ============================================================================

use crate::core::EntityKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A remote resource as fetched, keyed by its URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    /// Remote type name, e.g. `#ComputerSystem.v1_4_0.ComputerSystem`.
    pub resource_type: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Resource {
    pub fn new(uri: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            resource_type: resource_type.into(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn kind(&self) -> Option<EntityKind> {
        EntityKind::from_resource_type(&self.resource_type)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceLink {
    pub source_uri: String,
    pub target_uri: String,
    pub name: String,
}

impl ResourceLink {
    pub fn new(source_uri: impl Into<String>, target_uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source_uri: source_uri.into(),
            target_uri: target_uri.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGraph {
    /// Declared identity of the service the graph was fetched from.
    pub service_id: Uuid,
    resources: BTreeMap<String, Resource>,
    links: BTreeSet<ResourceLink>,
}

impl ResourceGraph {
    pub fn new(service_id: Uuid) -> Self {
        Self {
            service_id,
            resources: BTreeMap::new(),
            links: BTreeSet::new(),
        }
    }

    /// Adds or replaces a resource with the same URI.
    pub fn add_resource(&mut self, resource: Resource) {
        self.resources.insert(resource.uri.clone(), resource);
    }

    pub fn add_link(&mut self, link: ResourceLink) {
        self.links.insert(link);
    }

    pub fn resource(&self, uri: &str) -> Option<&Resource> {
        self.resources.get(uri)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn links(&self) -> impl Iterator<Item = &ResourceLink> {
        self.links.iter()
    }

    pub fn has_link(&self, source_uri: &str, target_uri: &str, name: &str) -> bool {
        self.links.iter().any(|link| {
            link.source_uri == source_uri && link.target_uri == target_uri && link.name == name
        })
    }

    pub fn uris(&self) -> BTreeSet<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resources_are_keyed_by_uri() {
        let mut graph = ResourceGraph::new(Uuid::new_v4());
        graph.add_resource(Resource::new("/Systems/1", "ComputerSystem").with_property("model", json!("A")));
        graph.add_resource(Resource::new("/Systems/1", "ComputerSystem").with_property("model", json!("B")));

        assert_eq!(graph.resource_count(), 1);
        assert_eq!(graph.resource("/Systems/1").and_then(|r| r.property_str("model")), Some("B"));
        assert_eq!(graph.resource("/Systems/1").and_then(Resource::kind), Some(EntityKind::ComputerSystem));
    }

    #[test]
    fn link_lookup_matches_all_fields() {
        let mut graph = ResourceGraph::new(Uuid::new_v4());
        graph.add_link(ResourceLink::new("/Chassis/1", "/Systems/1", "contains"));
        assert!(graph.has_link("/Chassis/1", "/Systems/1", "contains"));
        assert!(!graph.has_link("/Chassis/1", "/Systems/1", "managed_by"));
    }
}
