// ============================================================================
// Persisted Domain Model
// ============================================================================
//
// External services, the discoverable entities they own, the links between
// those entities, and the composed nodes built on top of them.
//
// ============================================================================

pub mod composed_node;
pub mod entity;
pub mod link;
pub mod service;

pub use composed_node::ComposedNode;
pub use entity::{DiscoverableEntity, EntityMetadata, normalize_identity};
pub use link::EntityLink;
pub use service::{ExternalService, ServiceEndpoint};
