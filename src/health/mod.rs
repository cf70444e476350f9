// ============================================================================
// Service Availability
// ============================================================================
//
// Reachability state machine for external services:
//
//   reachable ──confirmed failure──> unreachable ──grace elapsed──> removed
//       ^                                 │
//       └─────────successful probe────────┘
//
// A connection failure during a pass only asks for re-verification; the
// state flips after `verification_attempts` failed root fetches in a row
// or one identity mismatch.
//
// ============================================================================

pub mod availability;
pub mod removal;

use crate::core::Result;
use crate::model::ExternalService;
use crate::storage::StoreTx;
use async_trait::async_trait;
use uuid::Uuid;

pub use availability::{ServiceHealthManager, Verification};
pub use removal::{ServiceRemovalTask, ServiceRemovalWorker, spawn_service_removal_worker};

/// Runs inside the transaction that marks a service unreachable.
#[async_trait]
pub trait ServiceUnreachableHook: Send + Sync {
    async fn on_unreachable(&self, tx: &StoreTx, service: &ExternalService) -> Result<()>;
}

/// Told about committed availability changes, outside any transaction.
#[async_trait]
pub trait AvailabilityListener: Send + Sync {
    async fn service_unreachable(&self, service_id: Uuid);

    async fn service_reachable(&self, service_id: Uuid);

    async fn service_removed(&self, service_id: Uuid) {
        self.service_unreachable(service_id).await;
    }
}
