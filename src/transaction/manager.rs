// ============================================================================
// Transaction Manager
// ============================================================================

use super::TransactionId;
use crate::core::Result;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Tracks running transactions and the store version each one started from.
///
/// The oldest running snapshot bounds which tombstones are safe to vacuum.
/// Uses a std mutex because deregistration happens from `Drop`.
#[derive(Debug, Default)]
pub struct TransactionManager {
    active: Mutex<BTreeMap<TransactionId, u64>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, begin_version: u64) -> Result<TransactionId> {
        let txn_id = TransactionId::new();
        self.active.lock()?.insert(txn_id, begin_version);
        Ok(txn_id)
    }

    /// Removes a transaction from the active set. Idempotent.
    pub fn finish(&self, txn_id: TransactionId) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&txn_id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }

    /// Versions at or below the returned value are visible to every running
    /// transaction. With nothing running this is `current_version`.
    pub fn vacuum_horizon(&self, current_version: u64) -> Result<u64> {
        let active = self.active.lock()?;
        Ok(active
            .values()
            .copied()
            .min()
            .unwrap_or(current_version)
            .min(current_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horizon_tracks_oldest_active_snapshot() {
        let manager = TransactionManager::new();
        assert_eq!(manager.vacuum_horizon(10).unwrap(), 10);

        let old = manager.begin(4).unwrap();
        let newer = manager.begin(8).unwrap();
        assert_eq!(manager.vacuum_horizon(10).unwrap(), 4);

        manager.finish(old);
        assert_eq!(manager.vacuum_horizon(10).unwrap(), 8);

        manager.finish(newer);
        manager.finish(newer);
        assert_eq!(manager.active_count(), 0);
    }
}
