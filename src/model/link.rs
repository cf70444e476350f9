use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted named, directed association between two discoverables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityLink {
    pub source: Uuid,
    pub target: Uuid,
    pub name: String,
}

impl EntityLink {
    pub fn new(source: Uuid, target: Uuid, name: impl Into<String>) -> Self {
        Self {
            source,
            target,
            name: name.into(),
        }
    }

    pub fn touches(&self, entity_id: Uuid) -> bool {
        self.source == entity_id || self.target == entity_id
    }
}
