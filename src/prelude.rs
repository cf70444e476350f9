//! Types most embedders need, in one import.

pub use crate::config::DiscoveryConfig;
pub use crate::core::{
    ComposedNodeState, DeepDiscoveryState, DiscoveryError, EntityKind, Health, MappingDepth,
    Result, ServiceType, State, Status,
};
pub use crate::engine::{DiscoveryEngine, EngineSummary, RemoteCollaborators};
pub use crate::graph::{Resource, ResourceGraph, ResourceLink};
pub use crate::model::{ComposedNode, DiscoverableEntity, EntityLink, ExternalService, ServiceEndpoint};
pub use crate::remote::fixture::{FixtureServiceSpec, FixtureSpec};
pub use crate::remote::{FixtureFailure, FixtureRemote};
pub use crate::storage::{EntityStore, StoreState, StoreTx};
pub use crate::transaction::{TransactionPolicy, run_in_transaction};
