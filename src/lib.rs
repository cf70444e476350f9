// ============================================================================
// rack-discovery Library
// ============================================================================
//
// Keeps a local entity graph in sync with the inventory exposed by
// rack-scale management services.
//
//   DiscoveryScheduler ─> DiscoveryRunner ─> DiscoveryGraphMapper ─> EntityStore
//          │                    │
//   TaskCoordinator      ServiceHealthManager ─> ServiceRemovalTask
//
// ============================================================================

pub mod composition;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod discovery;
pub mod engine;
pub mod graph;
pub mod guard;
pub mod health;
pub mod mapping;
pub mod model;
pub mod prelude;
pub mod registry;
pub mod remote;
pub mod sanitize;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use config::DiscoveryConfig;
pub use core::{DiscoveryError, Result};
pub use engine::{DiscoveryEngine, EngineSummary, RemoteCollaborators, StartupReport};
