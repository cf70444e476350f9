// ============================================================================
// Remote Collaborators
// ============================================================================
//
// Contracts the engine needs from the southbound side: opening a session to
// a service, reading its root identity, crawling its resources into a
// graph, subscribing to its events and launching deep discovery.
//
// Errors must keep connectivity (`DiscoveryError::Connection`) apart from
// bad responses (`DiscoveryError::Protocol`); the runner branches on it.
//
// ============================================================================

pub mod crawler;
pub mod fixture;

use crate::core::Result;
use crate::graph::{Resource, ResourceGraph, ResourceLink};
use crate::model::{DiscoverableEntity, ExternalService};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crawler::CrawlingGraphBuilder;
pub use fixture::{FixtureFailure, FixtureRemote};

/// Cooperative cancellation probe. Returns `Err(Canceled)` once the pass
/// should stop.
pub type CancellationCheck<'a> = dyn Fn() -> Result<()> + Send + Sync + 'a;

/// Identity document served at a service's root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRoot {
    pub id: Uuid,
    pub name: String,
    /// Entry points of the resource tree.
    pub children: Vec<String>,
}

/// One fetched resource with the outgoing references it declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub resource: Resource,
    #[serde(default)]
    pub links: Vec<ResourceLink>,
}

#[async_trait]
pub trait RemoteReader: Send + Sync {
    /// Opens a session scoped to one pass. Released when dropped.
    async fn open(&self, base_uri: &str) -> Result<Box<dyn RemoteSession>>;
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn root(&self) -> Result<ServiceRoot>;

    async fn get(&self, uri: &str) -> Result<RemoteDocument>;
}

#[async_trait]
pub trait GraphBuilder: Send + Sync {
    /// Crawls the service behind `session`. Must call `check` at bounded
    /// intervals and stop with its error.
    async fn build(
        &self,
        session: &dyn RemoteSession,
        root: &ServiceRoot,
        check: &CancellationCheck<'_>,
    ) -> Result<ResourceGraph>;
}

#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// `Ok(false)` means the service does not support push notifications.
    async fn subscribe(&self, service: &ExternalService) -> Result<bool>;
}

#[async_trait]
pub trait DeepDiscoveryLauncher: Send + Sync {
    /// Boots the compute system into the limited image.
    async fn launch(&self, system: &DiscoverableEntity) -> Result<()>;
}
