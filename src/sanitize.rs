//! Startup sanitizers.
//!
//! Work that was in flight when the process died never finishes, so its
//! states are forced back to something the rest of the engine can act on
//! before any discovery runs.

use crate::core::{ComposedNodeState, DeepDiscoveryState, EntityKind, Result, Status};
use crate::storage::{EntityStore, StoreTx};
use crate::transaction::{TransactionPolicy, run_in_transaction};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait StartupSanitizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns how many records were changed.
    async fn sanitize(&self, tx: &StoreTx) -> Result<usize>;
}

/// Allocating / Allocated / Assembling nodes become Failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComposedNodeSanitizer;

#[async_trait]
impl StartupSanitizer for ComposedNodeSanitizer {
    fn name(&self) -> &'static str {
        "composed_nodes"
    }

    async fn sanitize(&self, tx: &StoreTx) -> Result<usize> {
        let mut changed = 0;
        for mut node in tx.composed_nodes().await? {
            if !node.state.is_in_progress() {
                continue;
            }
            warn!(node_id = %node.id, state = %node.state, "composed node left in progress, marking failed");
            node.state = ComposedNodeState::Failed;
            node.status = Some(Status::OFFLINE_CRITICAL);
            tx.save_composed_node(node).await?;
            changed += 1;
        }
        Ok(changed)
    }
}

/// WaitingToStart / Running compute systems go back to Initial.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepDiscoverySanitizer;

#[async_trait]
impl StartupSanitizer for DeepDiscoverySanitizer {
    fn name(&self) -> &'static str {
        "deep_discovery"
    }

    async fn sanitize(&self, tx: &StoreTx) -> Result<usize> {
        let systems = tx
            .entities_where(|entity| {
                entity.kind == EntityKind::ComputerSystem
                    && entity.metadata.deep_discovery_state.is_in_progress()
            })
            .await?;
        let changed = systems.len();
        for mut system in systems {
            system.metadata.deep_discovery_state = DeepDiscoveryState::Initial;
            tx.save_entity(system).await?;
        }
        Ok(changed)
    }
}

pub struct SanitizerSet {
    sanitizers: Vec<Box<dyn StartupSanitizer>>,
}

impl SanitizerSet {
    pub fn new() -> Self {
        Self {
            sanitizers: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut set = Self::new();
        set.register(Box::new(ComposedNodeSanitizer));
        set.register(Box::new(DeepDiscoverySanitizer));
        set
    }

    pub fn register(&mut self, sanitizer: Box<dyn StartupSanitizer>) {
        self.sanitizers.push(sanitizer);
    }

    /// Runs every sanitizer in one transaction. Counts are keyed by name.
    pub async fn run(
        &self,
        store: &Arc<EntityStore>,
        policy: &TransactionPolicy,
    ) -> Result<BTreeMap<&'static str, usize>> {
        let report = run_in_transaction(store, policy, |tx| self.run_once(tx)).await?;

        let total: usize = report.values().sum();
        if total > 0 {
            info!(?report, "startup sanitization reset in-progress states");
        }
        Ok(report)
    }

    async fn run_once(&self, tx: StoreTx) -> Result<BTreeMap<&'static str, usize>> {
        let mut report = BTreeMap::new();
        for sanitizer in &self.sanitizers {
            report.insert(sanitizer.name(), sanitizer.sanitize(&tx).await?);
        }
        Ok(report)
    }
}

impl Default for SanitizerSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}
