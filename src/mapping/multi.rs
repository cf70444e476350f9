use super::mapper::MapperRegistry;
use crate::core::{DiscoveryError, EntityKind, MappingDepth, Result, ServiceType};
use crate::graph::{Resource, ResourceGraph};
use crate::model::{DiscoverableEntity, ExternalService, normalize_identity};
use crate::storage::StoreTx;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Notified (inside the same transaction) when discovery deletes entities.
#[async_trait]
pub trait EntityRemovalListener: Send + Sync {
    async fn on_entities_removed(&self, tx: &StoreTx, removed: &[DiscoverableEntity]) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct MultiMapOutcome {
    /// Entities resolved this cycle, keyed by source URI in the graph.
    pub mapped: BTreeMap<String, DiscoverableEntity>,
    /// Resources with no mapper or an ambiguous identity.
    pub skipped: usize,
    /// Entities deleted as stale.
    pub removed: Vec<DiscoverableEntity>,
}

/// Resolves each fetched resource to an entity, maps it, and deletes the
/// service's discovery-owned entities that vanished from the graph.
pub struct EntityMultiMapper {
    mappers: Arc<MapperRegistry>,
    deep_discovery_enabled: bool,
    removal_listeners: Vec<Arc<dyn EntityRemovalListener>>,
}

impl EntityMultiMapper {
    pub fn new(mappers: Arc<MapperRegistry>, deep_discovery_enabled: bool) -> Self {
        Self {
            mappers,
            deep_discovery_enabled,
            removal_listeners: Vec::new(),
        }
    }

    pub fn with_removal_listener(mut self, listener: Arc<dyn EntityRemovalListener>) -> Self {
        self.removal_listeners.push(listener);
        self
    }

    pub async fn map_graph(
        &self,
        tx: &StoreTx,
        service: &ExternalService,
        graph: &ResourceGraph,
    ) -> Result<MultiMapOutcome> {
        let depth = MappingDepth::for_service(service.service_type, self.deep_discovery_enabled);
        let mut outcome = MultiMapOutcome::default();

        for resource in graph.resources() {
            match self.map_resource(tx, service, resource, depth, &mut outcome).await {
                Ok(Some(entity)) => {
                    outcome.mapped.insert(resource.uri.clone(), entity);
                }
                Ok(None) => outcome.skipped += 1,
                Err(DiscoveryError::AmbiguousMatch { uri, candidates }) => {
                    warn!(%uri, candidates, service_id = %service.id, "ambiguous match, resource skipped this cycle");
                    outcome.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        let stale = self.collect_stale(tx, service, graph).await?;
        for entity in stale {
            if let Some(removed) = tx.delete_entity(entity.id).await? {
                debug!(entity_id = %removed.id, uri = ?removed.source_uri, kind = %removed.kind, "removed stale entity");
                outcome.removed.push(removed);
            }
        }

        if !outcome.removed.is_empty() {
            for listener in &self.removal_listeners {
                listener.on_entities_removed(tx, &outcome.removed).await?;
            }
        }

        Ok(outcome)
    }

    async fn map_resource(
        &self,
        tx: &StoreTx,
        service: &ExternalService,
        resource: &Resource,
        depth: MappingDepth,
        outcome: &mut MultiMapOutcome,
    ) -> Result<Option<DiscoverableEntity>> {
        let Some(mapper) = self.mappers.find_mapper(&resource.resource_type, depth) else {
            trace!(uri = %resource.uri, resource_type = %resource.resource_type, "no mapper, skipped");
            return Ok(None);
        };
        let kind = mapper.target_kind();

        let mut entity = match self.resolve(tx, service, resource, kind).await? {
            Resolved::Existing(entity) => entity,
            Resolved::Replaced(old) => {
                // Same URI now serves a different kind of resource.
                if let Some(removed) = tx.delete_entity(old.id).await? {
                    outcome.removed.push(removed);
                }
                DiscoverableEntity::new(kind, service.id, Some(resource.uri.clone()))
            }
            Resolved::New => DiscoverableEntity::new(kind, service.id, Some(resource.uri.clone())),
        };
        let before = entity.clone();

        if let Err(err) = mapper.map(resource, &mut entity) {
            warn!(uri = %resource.uri, error = %err, "mapping failed, resource skipped this cycle");
            return Ok(None);
        }
        entity.discovered = true;

        if entity != before {
            tx.save_entity(entity.clone()).await?;
        }
        Ok(Some(entity))
    }

    async fn resolve(
        &self,
        tx: &StoreTx,
        service: &ExternalService,
        resource: &Resource,
        kind: EntityKind,
    ) -> Result<Resolved> {
        if service.service_type == ServiceType::LimitedImage
            && let Some(found) = self.resolve_by_identity(tx, service, resource, kind).await?
        {
            return Ok(Resolved::Existing(found));
        }

        match tx.find_entity_by_source(service.id, &resource.uri).await? {
            Some(existing) if existing.kind == kind => Ok(Resolved::Existing(existing)),
            Some(existing) => Ok(Resolved::Replaced(existing)),
            None => Ok(Resolved::New),
        }
    }

    /// Finds the entity another service already discovered for the same
    /// physical resource. `Ok(None)` when there is no identity to match on
    /// or no candidate.
    async fn resolve_by_identity(
        &self,
        tx: &StoreTx,
        service: &ExternalService,
        resource: &Resource,
        kind: EntityKind,
    ) -> Result<Option<DiscoverableEntity>> {
        let Some(property) = kind.identity_property() else {
            return Ok(None);
        };
        let Some(identity) = resource.property_str(property).map(normalize_identity) else {
            return Ok(None);
        };

        let owner = service.id;
        let mut candidates = tx
            .entities_where(|entity| {
                entity.kind == kind
                    && entity.service_id != owner
                    && entity.discovered
                    && entity.identity_key().as_deref() == Some(identity.as_str())
            })
            .await?;

        match candidates.len() {
            0 => Ok(None),
            1 => Ok(candidates.pop()),
            n => Err(DiscoveryError::AmbiguousMatch {
                uri: resource.uri.clone(),
                candidates: n,
            }),
        }
    }

    async fn collect_stale(
        &self,
        tx: &StoreTx,
        service: &ExternalService,
        graph: &ResourceGraph,
    ) -> Result<Vec<DiscoverableEntity>> {
        let seen: BTreeSet<&str> = graph.uris();
        let owned = tx.entities_of_service(service.id).await?;

        Ok(owned
            .into_iter()
            .filter(|entity| entity.discovered)
            .filter(|entity| match &entity.source_uri {
                Some(uri) => !seen.contains(uri.as_str()),
                None => false,
            })
            .filter(|entity| {
                if entity.metadata.storage_service_host {
                    debug!(entity_id = %entity.id, "stale entity hosts a storage service, kept");
                    return false;
                }
                true
            })
            .collect())
    }
}

enum Resolved {
    Existing(DiscoverableEntity),
    Replaced(DiscoverableEntity),
    New,
}
