use crate::config::DiscoveryConfig;
use crate::coordinator::CoordinatedTask;
use crate::core::{DiscoveryError, Result};
use crate::graph::ResourceGraph;
use crate::health::ServiceHealthManager;
use crate::mapping::{DiscoveryGraphMapper, MappingSummary};
use crate::registry::ServiceRegistry;
use crate::remote::{GraphBuilder, RemoteReader};
use crate::storage::EntityStore;
use crate::transaction::run_in_transaction;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Progress of the current (or last) pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    NotStarted,
    Fetching,
    Mapping,
    Done,
    Canceled,
    Failed,
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not_started",
            Self::Fetching => "fetching",
            Self::Mapping => "mapping",
            Self::Done => "done",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

/// Collaborators shared by every runner.
#[derive(Clone)]
pub struct RunnerContext {
    pub store: Arc<EntityStore>,
    pub reader: Arc<dyn RemoteReader>,
    pub builder: Arc<dyn GraphBuilder>,
    pub mapper: Arc<DiscoveryGraphMapper>,
    pub health: Arc<ServiceHealthManager>,
    pub config: DiscoveryConfig,
}

/// Executes discovery passes for one service. Reused across passes;
/// two runners are equal when they serve the same service.
pub struct DiscoveryRunner {
    service_id: Option<Uuid>,
    context: RunnerContext,
    registry: ServiceRegistry,
    cancel_requested: AtomicBool,
    state: Mutex<PassState>,
    completed_passes: AtomicU64,
    last_summary: Mutex<Option<MappingSummary>>,
}

impl DiscoveryRunner {
    pub fn new(service_id: Option<Uuid>, context: RunnerContext) -> Self {
        Self {
            service_id,
            context,
            registry: ServiceRegistry::new(),
            cancel_requested: AtomicBool::new(false),
            state: Mutex::new(PassState::NotStarted),
            completed_passes: AtomicU64::new(0),
            last_summary: Mutex::new(None),
        }
    }

    pub fn service_id(&self) -> Option<Uuid> {
        self.service_id
    }

    pub fn state(&self) -> PassState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PassState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn completed_passes(&self) -> u64 {
        self.completed_passes.load(Ordering::SeqCst)
    }

    pub fn last_summary(&self) -> Option<MappingSummary> {
        *self.summary_slot()
    }

    fn summary_slot(&self) -> MutexGuard<'_, Option<MappingSummary>> {
        self.last_summary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks a running pass to stop at its next checkpoint. Ignored when
    /// cancellation is disabled.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn check_canceled(&self) -> Result<()> {
        if self.context.config.cancellation_enabled && self.is_cancel_requested() {
            return Err(DiscoveryError::Canceled);
        }
        Ok(())
    }

    /// One discovery pass. Canceled passes return `Ok(PassState::Canceled)`.
    pub async fn run_pass(&self) -> Result<PassState> {
        let service_id = self.service_id.ok_or_else(|| {
            DiscoveryError::Configuration("discovery runner has no service id".to_string())
        })?;

        let span = info_span!("discovery_pass", %service_id);
        let result = self.execute(service_id).instrument(span).await;
        self.cancel_requested.store(false, Ordering::SeqCst);

        match result {
            Ok(summary) => {
                self.completed_passes.fetch_add(1, Ordering::SeqCst);
                *self.summary_slot() = summary;
                self.set_state(PassState::Done);
                Ok(PassState::Done)
            }
            Err(DiscoveryError::Canceled) => {
                debug!(%service_id, "discovery pass canceled");
                self.set_state(PassState::Canceled);
                Ok(PassState::Canceled)
            }
            Err(err) => {
                self.set_state(PassState::Failed);
                self.classify_failure(service_id, &err);
                Err(err)
            }
        }
    }

    fn classify_failure(&self, service_id: Uuid, err: &DiscoveryError) {
        match err {
            DiscoveryError::Connection(_) => {
                info!(%service_id, error = %err, "connection failure during discovery, verifying service");
                self.context.health.request_verification(service_id);
            }
            DiscoveryError::IdentityMismatch { .. } => {
                warn!(%service_id, error = %err, "service identity changed, verifying service");
                self.context.health.request_verification(service_id);
            }
            DiscoveryError::Protocol { message, context } => {
                warn!(%service_id, %message, %context, "unexpected response from service");
            }
            _ => {
                error!(%service_id, error = %err, "discovery pass failed");
            }
        }
    }

    /// `Ok(None)`: the service is gone, nothing was done.
    async fn execute(&self, service_id: Uuid) -> Result<Option<MappingSummary>> {
        self.set_state(PassState::NotStarted);
        let Some(service) = self.context.store.snapshot().await.service(service_id).cloned() else {
            debug!("service no longer exists, skipping pass");
            return Ok(None);
        };

        self.set_state(PassState::Fetching);
        if service.dirty {
            run_in_transaction(&self.context.store, &self.context.config.transaction, move |tx| async move {
                self.registry.mark_dirty(&tx, service_id, false).await
            })
            .await?;
        }

        let graph = self.fetch(service_id, &service.base_uri).await?;

        self.set_state(PassState::Mapping);
        self.check_canceled()?;
        let summary = self.context.mapper.map(&graph).await?;
        Ok(Some(summary))
    }

    async fn fetch(&self, service_id: Uuid, base_uri: &str) -> Result<ResourceGraph> {
        let session = self.context.reader.open(base_uri).await?;
        let root = session.root().await?;
        if root.id != service_id {
            return Err(DiscoveryError::IdentityMismatch {
                expected: service_id,
                actual: root.id,
            });
        }

        let check = || self.check_canceled();
        let graph = self.context.builder.build(session.as_ref(), &root, &check).await?;
        debug!(
            resources = graph.resource_count(),
            links = graph.link_count(),
            "resource graph fetched"
        );
        Ok(graph)
    }
}

impl PartialEq for DiscoveryRunner {
    fn eq(&self, other: &Self) -> bool {
        self.service_id == other.service_id
    }
}

impl Eq for DiscoveryRunner {}

impl fmt::Debug for DiscoveryRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryRunner")
            .field("service_id", &self.service_id)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl CoordinatedTask for DiscoveryRunner {
    async fn run(&self) -> Result<()> {
        self.run_pass().await.map(|_| ())
    }
}
