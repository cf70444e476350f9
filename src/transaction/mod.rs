// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Snapshot-isolated transactions over the entity store, plus the retrying
// runner every reconciliation step goes through.
//
// ============================================================================

pub mod manager;
pub mod retry;
pub mod state;

pub use manager::TransactionManager;
pub use retry::{TransactionPolicy, run_in_transaction};
pub use state::{TransactionId, TransactionState};
