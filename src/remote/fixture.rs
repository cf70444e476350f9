//! Scriptable in-memory remote services.
//!
//! Serves resource trees from memory through the same traits a network
//! client would implement. Inventories, identities and failures can be
//! changed while the engine runs; counters record what the engine did.

use super::{
    DeepDiscoveryLauncher, EventSubscriber, RemoteDocument, RemoteReader, RemoteSession,
    ServiceRoot,
};
use crate::core::{DiscoveryError, Result, ServiceType};
use crate::graph::{Resource, ResourceLink};
use crate::model::{DiscoverableEntity, ExternalService, ServiceEndpoint};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureFailure {
    /// Every request fails as if the endpoint refused the connection.
    Connection,
    /// Every request gets a malformed response.
    Protocol,
}

/// Serialized description of one remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureServiceSpec {
    pub id: Uuid,
    pub service_type: ServiceType,
    pub base_uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub links: Vec<ResourceLink>,
}

impl FixtureServiceSpec {
    pub fn new(id: Uuid, service_type: ServiceType, base_uri: impl Into<String>) -> Self {
        Self {
            id,
            service_type,
            base_uri: base_uri.into(),
            name: None,
            mac_address: None,
            resources: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> ServiceEndpoint {
        let endpoint = ServiceEndpoint::new(self.service_type, self.id, self.base_uri.clone());
        match &self.mac_address {
            Some(mac) => endpoint.with_mac_address(mac.clone()),
            None => endpoint,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureSpec {
    #[serde(default)]
    pub services: Vec<FixtureServiceSpec>,
}

impl FixtureSpec {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Clone)]
struct FixtureService {
    id: Uuid,
    name: String,
    resources: BTreeMap<String, Resource>,
    links: Vec<ResourceLink>,
    failure: Option<FixtureFailure>,
    subscribable: bool,
}

#[derive(Debug, Default)]
struct FixtureState {
    services: HashMap<String, FixtureService>,
    root_fetches: HashMap<String, usize>,
    open_sessions: HashMap<String, usize>,
    max_open_sessions: HashMap<String, usize>,
    subscriptions: HashMap<Uuid, usize>,
    launched: Vec<Uuid>,
    latency: Duration,
}

#[derive(Debug, Default)]
struct FixtureShared {
    state: Mutex<FixtureState>,
}

impl FixtureShared {
    fn lock(&self) -> MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory remote side. Cloning shares the same services.
#[derive(Debug, Clone, Default)]
pub struct FixtureRemote {
    shared: Arc<FixtureShared>,
}

impl FixtureRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_spec(spec: &FixtureSpec) -> Self {
        let remote = Self::new();
        for service in &spec.services {
            remote.add_service(service.clone());
        }
        remote
    }

    pub fn add_service(&self, spec: FixtureServiceSpec) {
        let service = FixtureService {
            id: spec.id,
            name: spec.name.unwrap_or_else(|| format!("{} service", spec.service_type)),
            resources: spec
                .resources
                .into_iter()
                .map(|resource| (resource.uri.clone(), resource))
                .collect(),
            links: spec.links,
            failure: None,
            subscribable: true,
        };
        self.shared.lock().services.insert(spec.base_uri, service);
    }

    fn with_service<F>(&self, base_uri: &str, update: F)
    where
        F: FnOnce(&mut FixtureService),
    {
        if let Some(service) = self.shared.lock().services.get_mut(base_uri) {
            update(service);
        }
    }

    pub fn upsert_resource(&self, base_uri: &str, resource: Resource) {
        self.with_service(base_uri, |service| {
            service.resources.insert(resource.uri.clone(), resource);
        });
    }

    /// Removes a resource and every link touching it.
    pub fn remove_resource(&self, base_uri: &str, uri: &str) {
        self.with_service(base_uri, |service| {
            service.resources.remove(uri);
            service
                .links
                .retain(|link| link.source_uri != uri && link.target_uri != uri);
        });
    }

    pub fn add_link(&self, base_uri: &str, link: ResourceLink) {
        self.with_service(base_uri, |service| {
            if !service.links.contains(&link) {
                service.links.push(link);
            }
        });
    }

    pub fn remove_link(&self, base_uri: &str, link: &ResourceLink) {
        self.with_service(base_uri, |service| service.links.retain(|l| l != link));
    }

    pub fn set_failure(&self, base_uri: &str, failure: Option<FixtureFailure>) {
        self.with_service(base_uri, |service| service.failure = failure);
    }

    /// Makes the endpoint at `base_uri` answer with a different identity.
    pub fn set_identity(&self, base_uri: &str, id: Uuid) {
        self.with_service(base_uri, |service| service.id = id);
    }

    pub fn set_subscribable(&self, base_uri: &str, subscribable: bool) {
        self.with_service(base_uri, |service| service.subscribable = subscribable);
    }

    /// Relocates a service to another address.
    pub fn move_service(&self, from: &str, to: &str) {
        let mut state = self.shared.lock();
        if let Some(service) = state.services.remove(from) {
            state.services.insert(to.to_string(), service);
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.shared.lock().latency = latency;
    }

    pub fn root_fetches(&self, base_uri: &str) -> usize {
        self.shared.lock().root_fetches.get(base_uri).copied().unwrap_or(0)
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.lock().open_sessions.values().sum()
    }

    /// Highest number of sessions that were open at once against `base_uri`.
    pub fn max_concurrent_sessions(&self, base_uri: &str) -> usize {
        self.shared
            .lock()
            .max_open_sessions
            .get(base_uri)
            .copied()
            .unwrap_or(0)
    }

    pub fn subscriptions(&self, service_id: Uuid) -> usize {
        self.shared
            .lock()
            .subscriptions
            .get(&service_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn launched(&self) -> Vec<Uuid> {
        self.shared.lock().launched.clone()
    }

    fn find_by_id(state: &FixtureState, id: Uuid) -> Option<&FixtureService> {
        state.services.values().find(|service| service.id == id)
    }
}

fn check_failure(service: &FixtureService, base_uri: &str) -> Result<()> {
    match service.failure {
        Some(FixtureFailure::Connection) => Err(DiscoveryError::Connection(format!(
            "connection refused: {base_uri}"
        ))),
        Some(FixtureFailure::Protocol) => Err(DiscoveryError::protocol(
            "unexpected response body",
            base_uri.to_string(),
        )),
        None => Ok(()),
    }
}

struct FixtureSession {
    shared: Arc<FixtureShared>,
    base_uri: String,
}

impl FixtureSession {
    async fn simulate_latency(&self) {
        let latency = self.shared.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Drop for FixtureSession {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(open) = state.open_sessions.get_mut(&self.base_uri) {
            *open = open.saturating_sub(1);
        }
    }
}

#[async_trait]
impl RemoteReader for FixtureRemote {
    async fn open(&self, base_uri: &str) -> Result<Box<dyn RemoteSession>> {
        {
            let mut state = self.shared.lock();
            let open = state.open_sessions.entry(base_uri.to_string()).or_insert(0);
            *open += 1;
            let current = *open;
            let max = state
                .max_open_sessions
                .entry(base_uri.to_string())
                .or_insert(0);
            *max = (*max).max(current);
        }
        Ok(Box::new(FixtureSession {
            shared: Arc::clone(&self.shared),
            base_uri: base_uri.to_string(),
        }))
    }
}

#[async_trait]
impl RemoteSession for FixtureSession {
    async fn root(&self) -> Result<ServiceRoot> {
        self.simulate_latency().await;
        let mut state = self.shared.lock();
        *state.root_fetches.entry(self.base_uri.clone()).or_insert(0) += 1;

        let service = state.services.get(&self.base_uri).ok_or_else(|| {
            DiscoveryError::Connection(format!("no route to host: {}", self.base_uri))
        })?;
        check_failure(service, &self.base_uri)?;

        Ok(ServiceRoot {
            id: service.id,
            name: service.name.clone(),
            children: service.resources.keys().cloned().collect(),
        })
    }

    async fn get(&self, uri: &str) -> Result<RemoteDocument> {
        self.simulate_latency().await;
        let state = self.shared.lock();
        let service = state.services.get(&self.base_uri).ok_or_else(|| {
            DiscoveryError::Connection(format!("no route to host: {}", self.base_uri))
        })?;
        check_failure(service, &self.base_uri)?;

        let resource = service.resources.get(uri).cloned().ok_or_else(|| {
            DiscoveryError::protocol(format!("resource {uri} not found"), self.base_uri.clone())
        })?;
        let links = service
            .links
            .iter()
            .filter(|link| link.source_uri == uri)
            .cloned()
            .collect();

        Ok(RemoteDocument { resource, links })
    }
}

#[async_trait]
impl EventSubscriber for FixtureRemote {
    async fn subscribe(&self, service: &ExternalService) -> Result<bool> {
        let mut state = self.shared.lock();
        let Some(remote) = state.services.get(&service.base_uri) else {
            return Err(DiscoveryError::Connection(format!(
                "no route to host: {}",
                service.base_uri
            )));
        };
        check_failure(remote, &service.base_uri)?;
        if !remote.subscribable {
            return Ok(false);
        }
        *state.subscriptions.entry(service.id).or_insert(0) += 1;
        Ok(true)
    }
}

#[async_trait]
impl DeepDiscoveryLauncher for FixtureRemote {
    async fn launch(&self, system: &DiscoverableEntity) -> Result<()> {
        let mut state = self.shared.lock();
        if FixtureRemote::find_by_id(&state, system.service_id).is_none() {
            return Err(DiscoveryError::Connection(format!(
                "owner of system {} is gone",
                system.id
            )));
        }
        state.launched.push(system.id);
        Ok(())
    }
}
