use super::finalizer::FinalizerRegistry;
use super::linker::EntityLinker;
use super::multi::EntityMultiMapper;
use crate::core::Result;
use crate::graph::ResourceGraph;
use crate::model::DiscoverableEntity;
use crate::storage::{EntityStore, StoreTx};
use crate::transaction::{TransactionPolicy, run_in_transaction};
use std::sync::Arc;
use tracing::{Instrument, debug, info_span};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingSummary {
    pub mapped: usize,
    pub skipped: usize,
    pub removed: usize,
    pub links_added: usize,
    pub links_removed: usize,
    /// The owning service no longer exists; nothing was written.
    pub service_missing: bool,
}

/// Maps a fetched graph into the store as one all-or-nothing unit of work.
pub struct DiscoveryGraphMapper {
    store: Arc<EntityStore>,
    policy: TransactionPolicy,
    multi_mapper: Arc<EntityMultiMapper>,
    linker: EntityLinker,
    finalizers: Arc<FinalizerRegistry>,
}

impl DiscoveryGraphMapper {
    pub fn new(
        store: Arc<EntityStore>,
        policy: TransactionPolicy,
        multi_mapper: Arc<EntityMultiMapper>,
        finalizers: Arc<FinalizerRegistry>,
    ) -> Self {
        Self {
            store,
            policy,
            multi_mapper,
            linker: EntityLinker::new(),
            finalizers,
        }
    }

    /// Multi-map, link, finalize. Replayed as a whole on write conflicts.
    pub async fn map(&self, graph: &ResourceGraph) -> Result<MappingSummary> {
        let span = info_span!("graph_mapping", service_id = %graph.service_id);
        let summary = run_in_transaction(&self.store, &self.policy, move |tx| self.map_once(tx, graph))
            .instrument(span)
            .await?;

        // Deletions leave tombstones behind; drop the ones nobody can see.
        if summary.removed > 0 || summary.links_removed > 0 {
            self.store.vacuum().await?;
        }
        Ok(summary)
    }

    async fn map_once(&self, tx: StoreTx, graph: &ResourceGraph) -> Result<MappingSummary> {
        let Some(service) = tx.service(graph.service_id).await? else {
            debug!("service vanished before mapping, nothing to do");
            return Ok(MappingSummary {
                service_missing: true,
                ..MappingSummary::default()
            });
        };

        let outcome = self.multi_mapper.map_graph(&tx, &service, graph).await?;
        let links = self.linker.apply_graph(&tx, graph, &outcome.mapped).await?;

        if let Some(finalizer) = self.finalizers.find_finalizer(service.service_type) {
            let touched: Vec<DiscoverableEntity> = outcome.mapped.values().cloned().collect();
            finalizer.finalize(&tx, &touched, &service).await?;
        }

        let summary = MappingSummary {
            mapped: outcome.mapped.len(),
            skipped: outcome.skipped,
            removed: outcome.removed.len(),
            links_added: links.added,
            links_removed: links.removed,
            service_missing: false,
        };
        debug!(
            mapped = summary.mapped,
            skipped = summary.skipped,
            removed = summary.removed,
            links_added = summary.links_added,
            links_removed = summary.links_removed,
            "graph mapped"
        );
        Ok(summary)
    }
}
