use crate::core::{DiscoveryError, Result};
use crate::storage::{EntityStore, StoreTx};
use log::warn;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry and timeout policy for transactional units of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    /// Upper bound for a single attempt, body and commit included.
    pub timeout_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_ms: 300_000,
            base_backoff_ms: 10,
            max_backoff_ms: 200,
        }
    }
}

impl TransactionPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns `true` when a failed attempt should be replayed.
    ///
    /// Only write-write conflicts qualify; everything else (timeouts
    /// included) goes straight back to the caller.
    fn should_retry(&self, attempt: usize, err: &DiscoveryError) -> bool {
        attempt < self.max_attempts.max(1) && err.is_retryable_conflict()
    }

    /// Exponential retry backoff in milliseconds.
    fn backoff_ms(&self, attempt: usize) -> u64 {
        let base = self.base_backoff_ms.max(1);
        let cap = self.max_backoff_ms.max(base);

        let mut backoff = base;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        backoff
    }
}

/// Runs `operation` inside a fresh transaction and commits it.
///
/// The closure is called again with a new transaction after a write-write
/// conflict, up to `policy.max_attempts` times. Any error from the body
/// rolls the attempt back.
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// use rack_discovery::prelude::*;
/// use uuid::Uuid;
///
/// let store = EntityStore::shared();
/// let policy = TransactionPolicy::default();
/// let service = ExternalService::new(Uuid::new_v4(), "http://10.0.0.1:8443", ServiceType::Storage);
///
/// let id = run_in_transaction(&store, &policy, |tx| {
///     let service = service.clone();
///     async move {
///         let id = service.id;
///         tx.save_service(service).await?;
///         Ok::<_, DiscoveryError>(id)
///     }
/// })
/// .await
/// .unwrap();
///
/// assert!(store.snapshot().await.service(id).is_some());
/// # });
/// ```
pub async fn run_in_transaction<F, Fut, T>(
    store: &Arc<EntityStore>,
    policy: &TransactionPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(StoreTx) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1usize;
    loop {
        let result = run_attempt(store, policy, &mut operation).await;

        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !policy.should_retry(attempt, &err) {
                    return Err(err);
                }

                let backoff_ms = policy.backoff_ms(attempt);
                warn!(
                    "transaction retry on conflict (attempt {} of {}): {} (backoff={}ms)",
                    attempt,
                    policy.max_attempts.max(1),
                    err,
                    backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

async fn run_attempt<F, Fut, T>(
    store: &Arc<EntityStore>,
    policy: &TransactionPolicy,
    operation: &mut F,
) -> Result<T>
where
    F: FnMut(StoreTx) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let tx = store.begin().await?;
    let timeout = policy.timeout();

    let outcome = tokio::time::timeout(timeout, async {
        let value = operation(tx.clone()).await?;
        tx.commit().await?;
        Ok::<T, DiscoveryError>(value)
    })
    .await;

    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            tx.rollback().await;
            Err(err)
        }
        Err(_) => {
            tx.rollback().await;
            Err(DiscoveryError::TransactionTimeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = TransactionPolicy {
            max_attempts: 5,
            timeout_ms: 1_000,
            base_backoff_ms: 10,
            max_backoff_ms: 35,
        };
        assert_eq!(policy.backoff_ms(1), 10);
        assert_eq!(policy.backoff_ms(2), 20);
        assert_eq!(policy.backoff_ms(3), 35);
        assert_eq!(policy.backoff_ms(4), 35);
    }

    #[test]
    fn only_conflicts_are_retried() {
        let policy = TransactionPolicy::default();
        let conflict = DiscoveryError::WriteConflict("entity".into());
        assert!(policy.should_retry(1, &conflict));
        assert!(policy.should_retry(2, &conflict));
        assert!(!policy.should_retry(3, &conflict));
        assert!(!policy.should_retry(1, &DiscoveryError::TransactionTimeout(Duration::from_secs(1))));
        assert!(!policy.should_retry(1, &DiscoveryError::Connection("refused".into())));
    }
}
