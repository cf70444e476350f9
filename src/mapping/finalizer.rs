use crate::core::{DeepDiscoveryState, EntityKind, Result, ServiceType};
use crate::model::{DiscoverableEntity, ExternalService};
use crate::storage::StoreTx;
use async_trait::async_trait;
use tracing::{debug, info};

/// Post-discovery hook for one family of services.
#[async_trait]
pub trait DiscoveryFinalizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, service_type: ServiceType) -> bool;

    /// `entities` is everything mapped this cycle, not only what changed.
    async fn finalize(
        &self,
        tx: &StoreTx,
        entities: &[DiscoverableEntity],
        service: &ExternalService,
    ) -> Result<()>;
}

#[derive(Default)]
pub struct FinalizerRegistry {
    finalizers: Vec<Box<dyn DiscoveryFinalizer>>,
}

impl FinalizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, finalizer: Box<dyn DiscoveryFinalizer>) {
        debug!(finalizer = finalizer.name(), "registered discovery finalizer");
        self.finalizers.push(finalizer);
    }

    /// First registered finalizer claiming the service type.
    ///
    /// Exclusivity is not checked: a later match is simply never used.
    pub fn find_finalizer(&self, service_type: ServiceType) -> Option<&dyn DiscoveryFinalizer> {
        self.finalizers
            .iter()
            .find(|finalizer| finalizer.applies_to(service_type))
            .map(|boxed| &**boxed)
    }

    pub fn len(&self) -> usize {
        self.finalizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finalizers.is_empty()
    }
}

/// Limited-image services only come up while deep discovery runs; once one
/// has been mapped, the compute systems it described are done.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepDiscoveryCompletion;

#[async_trait]
impl DiscoveryFinalizer for DeepDiscoveryCompletion {
    fn name(&self) -> &'static str {
        "deep_discovery_completion"
    }

    fn applies_to(&self, service_type: ServiceType) -> bool {
        service_type == ServiceType::LimitedImage
    }

    async fn finalize(
        &self,
        tx: &StoreTx,
        entities: &[DiscoverableEntity],
        service: &ExternalService,
    ) -> Result<()> {
        for entity in entities {
            if entity.kind != EntityKind::ComputerSystem
                || entity.metadata.deep_discovery_state != DeepDiscoveryState::Running
            {
                continue;
            }
            // Re-read: the copy in `entities` predates earlier writes of this cycle.
            let Some(mut system) = tx.entity(entity.id).await? else {
                continue;
            };
            system.metadata.deep_discovery_state = DeepDiscoveryState::Done;
            tx.save_entity(system).await?;
            info!(system_id = %entity.id, limited_image = %service.id, "deep discovery finished");
        }
        Ok(())
    }
}
