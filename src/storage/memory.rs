use super::table::VersionedTable;
use super::tx::StoreTx;
use crate::core::{EntityKind, Result};
use crate::model::{ComposedNode, DiscoverableEntity, EntityLink, ExternalService};
use crate::transaction::TransactionManager;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Full content of the store at one version.
///
/// Both the committed state and every transaction's private working copy are
/// a `StoreState`; cloning one is cheap because every table is persistent.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    pub(crate) services: VersionedTable<Uuid, ExternalService>,
    pub(crate) entities: VersionedTable<Uuid, DiscoverableEntity>,
    pub(crate) links: VersionedTable<EntityLink, ()>,
    pub(crate) composed_nodes: VersionedTable<Uuid, ComposedNode>,
    /// (owning service, source uri) -> entity id
    pub(crate) source_index: im::HashMap<(Uuid, String), Uuid>,
    pub(crate) version: u64,
}

impl StoreState {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn service(&self, id: Uuid) -> Option<&ExternalService> {
        self.services.get(&id)
    }

    pub fn services(&self) -> Vec<ExternalService> {
        self.services.values().cloned().collect()
    }

    pub fn entity(&self, id: Uuid) -> Option<&DiscoverableEntity> {
        self.entities.get(&id)
    }

    pub fn find_entity_by_source(&self, service_id: Uuid, source_uri: &str) -> Option<&DiscoverableEntity> {
        self.source_index
            .get(&(service_id, source_uri.to_string()))
            .and_then(|id| self.entities.get(id))
    }

    pub fn entities_of_service(&self, service_id: Uuid) -> Vec<DiscoverableEntity> {
        self.entities_where(|entity| entity.service_id == service_id)
    }

    pub fn entities_of_kind(&self, kind: EntityKind) -> Vec<DiscoverableEntity> {
        self.entities_where(|entity| entity.kind == kind)
    }

    pub fn entities_where<P>(&self, predicate: P) -> Vec<DiscoverableEntity>
    where
        P: Fn(&DiscoverableEntity) -> bool,
    {
        let mut matches: Vec<DiscoverableEntity> = self
            .entities
            .values()
            .filter(|entity| predicate(entity))
            .cloned()
            .collect();
        // stable order keeps mapping and finalizers deterministic
        matches.sort_by(|a, b| a.source_uri.cmp(&b.source_uri).then(a.id.cmp(&b.id)));
        matches
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn links(&self) -> Vec<EntityLink> {
        let mut links: Vec<EntityLink> = self.links.iter().map(|(link, _)| link.clone()).collect();
        links.sort();
        links
    }

    pub fn links_of(&self, entity_id: Uuid) -> Vec<EntityLink> {
        let mut links: Vec<EntityLink> = self
            .links
            .iter()
            .map(|(link, _)| link)
            .filter(|link| link.touches(entity_id))
            .cloned()
            .collect();
        links.sort();
        links
    }

    pub fn has_link(&self, link: &EntityLink) -> bool {
        self.links.contains(link)
    }

    pub fn composed_node(&self, id: Uuid) -> Option<&ComposedNode> {
        self.composed_nodes.get(&id)
    }

    pub fn composed_nodes(&self) -> Vec<ComposedNode> {
        let mut nodes: Vec<ComposedNode> = self.composed_nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        nodes
    }

    pub fn tombstone_count(&self) -> usize {
        self.services.tombstone_count()
            + self.entities.tombstone_count()
            + self.links.tombstone_count()
            + self.composed_nodes.tombstone_count()
    }

    // ------------------------------------------------------------------------
    // Mutation helpers shared by commit and transaction working copies
    // ------------------------------------------------------------------------

    pub(crate) fn put_entity(&mut self, entity: DiscoverableEntity, version: u64) {
        if let Some(previous) = self.entities.get(&entity.id)
            && let Some(uri) = &previous.source_uri
            && previous.source_uri != entity.source_uri
        {
            self.source_index.remove(&(previous.service_id, uri.clone()));
        }
        if let Some(uri) = &entity.source_uri {
            self.source_index
                .insert((entity.service_id, uri.clone()), entity.id);
        }
        self.entities.put(entity.id, entity, version);
    }

    pub(crate) fn remove_entity(&mut self, id: Uuid, version: u64) -> Option<DiscoverableEntity> {
        let removed = self.entities.tombstone(&id, version)?;
        if let Some(uri) = &removed.source_uri {
            let key = (removed.service_id, uri.clone());
            if self.source_index.get(&key) == Some(&id) {
                self.source_index.remove(&key);
            }
        }
        Some(removed)
    }

    fn vacuum(&mut self, horizon: u64) -> usize {
        self.services.vacuum(horizon)
            + self.entities.vacuum(horizon)
            + self.links.vacuum(horizon)
            + self.composed_nodes.vacuum(horizon)
    }
}

/// In-memory transactional store for services, entities, links and
/// composed nodes.
pub struct EntityStore {
    pub(crate) state: RwLock<StoreState>,
    pub(crate) transactions: TransactionManager,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            transactions: TransactionManager::new(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Starts a transaction over the currently committed state.
    pub async fn begin(self: &Arc<Self>) -> Result<StoreTx> {
        let snapshot = self.state.read().await.clone();
        let txn_id = self.transactions.begin(snapshot.version)?;
        Ok(StoreTx::new(Arc::clone(self), txn_id, snapshot))
    }

    /// Read-only copy of the committed state.
    pub async fn snapshot(&self) -> StoreState {
        self.state.read().await.clone()
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    pub fn active_transactions(&self) -> usize {
        self.transactions.active_count()
    }

    /// Drops tombstones no running transaction can conflict with anymore.
    pub async fn vacuum(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        let horizon = self.transactions.vacuum_horizon(state.version)?;
        let removed = state.vacuum(horizon);
        if removed > 0 {
            tracing::debug!(removed, horizon, "vacuumed store tombstones");
        }
        Ok(removed)
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}
