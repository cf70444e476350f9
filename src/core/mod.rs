pub mod error;
pub mod types;

pub use error::{DiscoveryError, Result};
pub use types::{
    ComposedNodeState, DeepDiscoveryState, EntityKind, Health, MappingDepth, ServiceType, State,
    Status,
};
