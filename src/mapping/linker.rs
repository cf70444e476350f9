use crate::core::Result;
use crate::graph::ResourceGraph;
use crate::model::{DiscoverableEntity, EntityLink};
use crate::storage::StoreTx;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkChanges {
    pub added: usize,
    pub removed: usize,
}

/// Keeps persisted links in step with graph edges.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityLinker;

impl EntityLinker {
    pub fn new() -> Self {
        Self
    }

    /// Idempotent: returns `false` when the link already existed.
    pub async fn link(
        &self,
        tx: &StoreTx,
        source: &DiscoverableEntity,
        target: &DiscoverableEntity,
        name: &str,
    ) -> Result<bool> {
        tx.add_link(EntityLink::new(source.id, target.id, name)).await
    }

    pub async fn unlink(&self, tx: &StoreTx, link: &EntityLink) -> Result<bool> {
        tx.remove_link(link).await
    }

    /// A persisted link may be removed only if both endpoints were mapped
    /// this cycle and the graph no longer has the edge.
    pub fn is_removable(
        link: &EntityLink,
        mapped_ids: &HashSet<Uuid>,
        desired: &BTreeSet<EntityLink>,
    ) -> bool {
        mapped_ids.contains(&link.source) && mapped_ids.contains(&link.target) && !desired.contains(link)
    }

    /// Applies every graph edge whose endpoints resolved this cycle, then
    /// drops the edges that disappeared between mapped entities.
    pub async fn apply_graph(
        &self,
        tx: &StoreTx,
        graph: &ResourceGraph,
        mapped: &BTreeMap<String, DiscoverableEntity>,
    ) -> Result<LinkChanges> {
        let mut changes = LinkChanges::default();
        let mut desired = BTreeSet::new();

        for edge in graph.links() {
            let (Some(source), Some(target)) = (mapped.get(&edge.source_uri), mapped.get(&edge.target_uri)) else {
                continue;
            };
            if self.link(tx, source, target, &edge.name).await? {
                changes.added += 1;
            }
            desired.insert(EntityLink::new(source.id, target.id, edge.name.clone()));
        }

        let mapped_ids: HashSet<Uuid> = mapped.values().map(|entity| entity.id).collect();
        let mut candidates = BTreeSet::new();
        for id in &mapped_ids {
            candidates.extend(tx.links_of(*id).await?);
        }

        for link in candidates {
            if Self::is_removable(&link, &mapped_ids, &desired) && self.unlink(tx, &link).await? {
                changes.removed += 1;
            }
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_to_unmapped_entities_are_not_removable() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let gone = Uuid::new_v4();
        let mapped: HashSet<Uuid> = [a, b].into_iter().collect();
        let desired = BTreeSet::new();

        assert!(EntityLinker::is_removable(&EntityLink::new(a, b, "x"), &mapped, &desired));
        assert!(!EntityLinker::is_removable(&EntityLink::new(a, gone, "x"), &mapped, &desired));

        let kept: BTreeSet<EntityLink> = [EntityLink::new(a, b, "x")].into_iter().collect();
        assert!(!EntityLinker::is_removable(&EntityLink::new(a, b, "x"), &mapped, &kept));
    }
}
