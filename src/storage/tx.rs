use super::memory::{EntityStore, StoreState};
use crate::core::{DiscoveryError, EntityKind, Result};
use crate::model::{ComposedNode, DiscoverableEntity, EntityLink, ExternalService};
use crate::transaction::{TransactionId, TransactionState};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct WriteSet {
    services: HashSet<Uuid>,
    entities: HashSet<Uuid>,
    links: HashSet<EntityLink>,
    composed_nodes: HashSet<Uuid>,
}

impl WriteSet {
    fn is_empty(&self) -> bool {
        self.services.is_empty()
            && self.entities.is_empty()
            && self.links.is_empty()
            && self.composed_nodes.is_empty()
    }
}

struct TxInner {
    store: Arc<EntityStore>,
    id: TransactionId,
    state: TransactionState,
    begin_version: u64,
    working: StoreState,
    writes: WriteSet,
}

impl Drop for TxInner {
    fn drop(&mut self) {
        if self.state.is_active() {
            tracing::trace!(txn = %self.id, "transaction dropped without commit, rolled back");
        }
        self.store.transactions.finish(self.id);
    }
}

/// Handle to a running transaction.
///
/// Clones share the same transaction, so a handle can be passed into
/// finalizers and hooks while the caller keeps its own for commit.
#[derive(Clone)]
pub struct StoreTx {
    id: TransactionId,
    inner: Arc<Mutex<TxInner>>,
}

impl std::fmt::Debug for StoreTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTx").field("id", &self.id).finish()
    }
}

impl StoreTx {
    pub(crate) fn new(store: Arc<EntityStore>, id: TransactionId, snapshot: StoreState) -> Self {
        let begin_version = snapshot.version;
        Self {
            id,
            inner: Arc::new(Mutex::new(TxInner {
                store,
                id,
                state: TransactionState::Active,
                begin_version,
                working: snapshot,
                writes: WriteSet::default(),
            })),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub async fn state(&self) -> TransactionState {
        self.inner.lock().await.state
    }

    /// Runs a read against the transaction's view (snapshot + own writes).
    pub async fn read<R, F>(&self, reader: F) -> Result<R>
    where
        F: FnOnce(&StoreState) -> R,
    {
        let inner = self.inner.lock().await;
        ensure_active(&inner)?;
        Ok(reader(&inner.working))
    }

    // ------------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------------

    pub async fn service(&self, id: Uuid) -> Result<Option<ExternalService>> {
        self.read(|state| state.service(id).cloned()).await
    }

    pub async fn services(&self) -> Result<Vec<ExternalService>> {
        self.read(StoreState::services).await
    }

    pub async fn save_service(&self, service: ExternalService) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure_active(&inner)?;
        let version = inner.begin_version;
        inner.writes.services.insert(service.id);
        inner.working.services.put(service.id, service, version);
        Ok(())
    }

    pub async fn delete_service(&self, id: Uuid) -> Result<Option<ExternalService>> {
        let mut inner = self.inner.lock().await;
        ensure_active(&inner)?;
        let version = inner.begin_version;
        let removed = inner.working.services.tombstone(&id, version);
        if removed.is_some() {
            inner.writes.services.insert(id);
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------------

    pub async fn entity(&self, id: Uuid) -> Result<Option<DiscoverableEntity>> {
        self.read(|state| state.entity(id).cloned()).await
    }

    pub async fn find_entity_by_source(
        &self,
        service_id: Uuid,
        source_uri: &str,
    ) -> Result<Option<DiscoverableEntity>> {
        self.read(|state| state.find_entity_by_source(service_id, source_uri).cloned())
            .await
    }

    pub async fn entities_of_service(&self, service_id: Uuid) -> Result<Vec<DiscoverableEntity>> {
        self.read(|state| state.entities_of_service(service_id)).await
    }

    pub async fn entities_of_kind(&self, kind: EntityKind) -> Result<Vec<DiscoverableEntity>> {
        self.read(|state| state.entities_of_kind(kind)).await
    }

    pub async fn entities_where<P>(&self, predicate: P) -> Result<Vec<DiscoverableEntity>>
    where
        P: Fn(&DiscoverableEntity) -> bool,
    {
        self.read(|state| state.entities_where(predicate)).await
    }

    pub async fn save_entity(&self, entity: DiscoverableEntity) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure_active(&inner)?;
        let version = inner.begin_version;
        inner.writes.entities.insert(entity.id);
        inner.working.put_entity(entity, version);
        Ok(())
    }

    /// Deletes an entity together with every link touching it.
    pub async fn delete_entity(&self, id: Uuid) -> Result<Option<DiscoverableEntity>> {
        let mut inner = self.inner.lock().await;
        ensure_active(&inner)?;
        let version = inner.begin_version;
        let Some(removed) = inner.working.remove_entity(id, version) else {
            return Ok(None);
        };
        inner.writes.entities.insert(id);

        for link in inner.working.links_of(id) {
            inner.working.links.tombstone(&link, version);
            inner.writes.links.insert(link);
        }
        Ok(Some(removed))
    }

    // ------------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------------

    pub async fn links(&self) -> Result<Vec<EntityLink>> {
        self.read(StoreState::links).await
    }

    pub async fn links_of(&self, entity_id: Uuid) -> Result<Vec<EntityLink>> {
        self.read(|state| state.links_of(entity_id)).await
    }

    /// Returns `false` if the link already existed.
    pub async fn add_link(&self, link: EntityLink) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        ensure_active(&inner)?;
        if inner.working.has_link(&link) {
            return Ok(false);
        }
        let version = inner.begin_version;
        inner.writes.links.insert(link.clone());
        inner.working.links.put(link, (), version);
        Ok(true)
    }

    /// Returns `false` if there was nothing to remove.
    pub async fn remove_link(&self, link: &EntityLink) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        ensure_active(&inner)?;
        let version = inner.begin_version;
        if inner.working.links.tombstone(link, version).is_none() {
            return Ok(false);
        }
        inner.writes.links.insert(link.clone());
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Composed nodes
    // ------------------------------------------------------------------------

    pub async fn composed_node(&self, id: Uuid) -> Result<Option<ComposedNode>> {
        self.read(|state| state.composed_node(id).cloned()).await
    }

    pub async fn composed_nodes(&self) -> Result<Vec<ComposedNode>> {
        self.read(StoreState::composed_nodes).await
    }

    pub async fn save_composed_node(&self, node: ComposedNode) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure_active(&inner)?;
        let version = inner.begin_version;
        inner.writes.composed_nodes.insert(node.id);
        inner.working.composed_nodes.put(node.id, node, version);
        Ok(())
    }

    pub async fn delete_composed_node(&self, id: Uuid) -> Result<Option<ComposedNode>> {
        let mut inner = self.inner.lock().await;
        ensure_active(&inner)?;
        let version = inner.begin_version;
        let removed = inner.working.composed_nodes.tombstone(&id, version);
        if removed.is_some() {
            inner.writes.composed_nodes.insert(id);
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    /// Publishes the transaction's writes.
    ///
    /// Fails with `WriteConflict` (and aborts) when any written key was
    /// committed by someone else after this transaction began.
    pub async fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure_active(&inner)?;

        if inner.writes.is_empty() {
            inner.state = TransactionState::Committed;
            inner.store.transactions.finish(inner.id);
            return Ok(());
        }

        let store = Arc::clone(&inner.store);
        let mut committed = store.state.write().await;

        if let Err(err) = detect_conflicts(&inner, &committed) {
            inner.state = TransactionState::Aborted;
            inner.store.transactions.finish(inner.id);
            return Err(err);
        }

        let version = committed.version + 1;
        let writes = std::mem::take(&mut inner.writes);

        for id in &writes.services {
            match inner.working.services.get(id) {
                Some(service) => committed.services.put(*id, service.clone(), version),
                None => {
                    committed.services.tombstone(id, version);
                }
            }
        }
        for id in &writes.entities {
            match inner.working.entities.get(id) {
                Some(entity) => committed.put_entity(entity.clone(), version),
                None => {
                    committed.remove_entity(*id, version);
                }
            }
        }
        for link in &writes.links {
            if inner.working.links.contains(link) {
                committed.links.put(link.clone(), (), version);
            } else {
                committed.links.tombstone(link, version);
            }
        }
        for id in &writes.composed_nodes {
            match inner.working.composed_nodes.get(id) {
                Some(node) => committed.composed_nodes.put(*id, node.clone(), version),
                None => {
                    committed.composed_nodes.tombstone(id, version);
                }
            }
        }

        committed.version = version;
        inner.state = TransactionState::Committed;
        inner.store.transactions.finish(inner.id);
        tracing::trace!(txn = %inner.id, version, "transaction committed");
        Ok(())
    }

    /// Discards every write. Safe to call on a finished transaction.
    pub async fn rollback(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_active() {
            inner.state = TransactionState::Aborted;
            inner.writes = WriteSet::default();
            inner.store.transactions.finish(inner.id);
        }
    }
}

fn ensure_active(inner: &TxInner) -> Result<()> {
    if inner.state.is_active() {
        Ok(())
    } else {
        Err(DiscoveryError::Storage(format!(
            "transaction {} is {}",
            inner.id, inner.state
        )))
    }
}

fn detect_conflicts(inner: &TxInner, committed: &StoreState) -> Result<()> {
    let begin = inner.begin_version;
    let conflict = |what: String| Err(DiscoveryError::WriteConflict(what));

    for id in &inner.writes.services {
        if committed.services.version_of(id) > begin {
            return conflict(format!("service {id}"));
        }
    }
    for id in &inner.writes.entities {
        if committed.entities.version_of(id) > begin {
            return conflict(format!("entity {id}"));
        }
        // Another transaction created a different entity for the same source.
        if let Some(entity) = inner.working.entities.get(id)
            && let Some(uri) = &entity.source_uri
            && let Some(other) = committed.source_index.get(&(entity.service_id, uri.clone()))
            && other != id
            && committed.entities.version_of(other) > begin
        {
            return conflict(format!("source {uri} of service {}", entity.service_id));
        }
    }
    for link in &inner.writes.links {
        if committed.links.version_of(link) > begin {
            return conflict(format!("link {} -> {} ({})", link.source, link.target, link.name));
        }
    }
    for id in &inner.writes.composed_nodes {
        if committed.composed_nodes.version_of(id) > begin {
            return conflict(format!("composed node {id}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServiceType;

    fn service() -> ExternalService {
        ExternalService::new(Uuid::new_v4(), "http://10.1.0.1:8443", ServiceType::PrimaryCompute)
    }

    #[tokio::test]
    async fn writes_are_private_until_commit() {
        let store = EntityStore::shared();
        let tx = store.begin().await.unwrap();
        let svc = service();
        tx.save_service(svc.clone()).await.unwrap();

        assert!(store.snapshot().await.service(svc.id).is_none());
        assert!(tx.service(svc.id).await.unwrap().is_some());

        tx.commit().await.unwrap();
        assert!(store.snapshot().await.service(svc.id).is_some());
        assert_eq!(store.active_transactions(), 0);
    }

    #[tokio::test]
    async fn concurrent_writes_to_same_key_conflict() {
        let store = EntityStore::shared();
        let svc = service();
        let seed = store.begin().await.unwrap();
        seed.save_service(svc.clone()).await.unwrap();
        seed.commit().await.unwrap();

        let first = store.begin().await.unwrap();
        let second = store.begin().await.unwrap();

        let mut a = svc.clone();
        a.dirty = true;
        first.save_service(a).await.unwrap();
        let mut b = svc.clone();
        b.reachable = false;
        second.save_service(b).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_retryable_conflict());
        assert_eq!(second.state().await, TransactionState::Aborted);

        let committed = store.snapshot().await;
        assert!(committed.service(svc.id).unwrap().dirty);
        assert!(committed.service(svc.id).unwrap().reachable);
    }

    #[tokio::test]
    async fn deleting_entity_drops_its_links() {
        let store = EntityStore::shared();
        let owner = Uuid::new_v4();
        let system = DiscoverableEntity::new(EntityKind::ComputerSystem, owner, Some("/Systems/1".into()));
        let chassis = DiscoverableEntity::new(EntityKind::Chassis, owner, Some("/Chassis/1".into()));
        let link = EntityLink::new(chassis.id, system.id, "contains");

        let tx = store.begin().await.unwrap();
        tx.save_entity(system.clone()).await.unwrap();
        tx.save_entity(chassis.clone()).await.unwrap();
        assert!(tx.add_link(link.clone()).await.unwrap());
        assert!(!tx.add_link(link.clone()).await.unwrap());
        tx.commit().await.unwrap();

        let tx = store.begin().await.unwrap();
        tx.delete_entity(system.id).await.unwrap();
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await;
        assert!(snapshot.entity(system.id).is_none());
        assert!(snapshot.links().is_empty());
        assert!(snapshot.find_entity_by_source(owner, "/Systems/1").is_none());
        assert_eq!(
            snapshot.find_entity_by_source(owner, "/Chassis/1").map(|e| e.id),
            Some(chassis.id)
        );
    }

    #[tokio::test]
    async fn vacuum_keeps_tombstones_visible_to_running_transactions() {
        let store = EntityStore::shared();
        let svc = service();
        let tx = store.begin().await.unwrap();
        tx.save_service(svc.clone()).await.unwrap();
        tx.commit().await.unwrap();

        let reader = store.begin().await.unwrap();

        let tx = store.begin().await.unwrap();
        tx.delete_service(svc.id).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.vacuum().await.unwrap(), 0);
        drop(reader);
        assert_eq!(store.vacuum().await.unwrap(), 1);
        assert_eq!(store.snapshot().await.tombstone_count(), 0);
    }

    #[tokio::test]
    async fn finished_transaction_rejects_further_use() {
        let store = EntityStore::shared();
        let tx = store.begin().await.unwrap();
        tx.rollback().await;
        assert!(tx.save_service(service()).await.is_err());
        assert!(tx.commit().await.is_err());
    }
}
