//! Keyed single-flight execution.
//!
//! At most one unit of work runs per key. A submission that finds its key
//! busy is coalesced into the running one; a rerun request instead queues
//! exactly one follow-up run that starts when the current one finishes.

use crate::core::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Discovery,
    DeepDiscovery,
    Verification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub kind: TaskKind,
    pub service_id: Uuid,
}

impl TaskKey {
    pub fn discovery(service_id: Uuid) -> Self {
        Self {
            kind: TaskKind::Discovery,
            service_id,
        }
    }

    pub fn deep_discovery(service_id: Uuid) -> Self {
        Self {
            kind: TaskKind::DeepDiscovery,
            service_id,
        }
    }

    pub fn verification(service_id: Uuid) -> Self {
        Self {
            kind: TaskKind::Verification,
            service_id,
        }
    }
}

#[async_trait]
pub trait CoordinatedTask: Send + Sync {
    async fn run(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Started,
    /// Key was busy; the running task covers this submission.
    Coalesced,
    /// Key was busy; one more run will follow the current one.
    RerunQueued,
}

#[derive(Debug)]
struct Slot {
    token: u64,
    rerun: bool,
}

#[derive(Debug, Default)]
pub struct TaskCoordinator {
    inflight: Mutex<HashMap<TaskKey, Slot>>,
    next_token: AtomicU64,
}

/// Releases the key when the run ends, including on abort or panic.
struct InflightGuard {
    coordinator: Arc<TaskCoordinator>,
    key: TaskKey,
    token: u64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut inflight = self.coordinator.lock();
        if inflight.get(&self.key).map(|slot| slot.token) == Some(self.token) {
            inflight.remove(&self.key);
        }
    }
}

impl TaskCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskKey, Slot>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(self: &Arc<Self>, key: TaskKey) -> Option<InflightGuard> {
        let mut inflight = self.lock();
        if inflight.contains_key(&key) {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        inflight.insert(key, Slot { token, rerun: false });
        Some(InflightGuard {
            coordinator: Arc::clone(self),
            key,
            token,
        })
    }

    /// Consumes a pending rerun request, or releases the key if there is none.
    fn finish_or_rerun(&self, guard: &InflightGuard) -> bool {
        let mut inflight = self.lock();
        match inflight.get_mut(&guard.key) {
            Some(slot) if slot.token == guard.token && slot.rerun => {
                slot.rerun = false;
                true
            }
            Some(slot) if slot.token == guard.token => {
                inflight.remove(&guard.key);
                false
            }
            _ => false,
        }
    }

    pub fn is_running(&self, key: TaskKey) -> bool {
        self.lock().contains_key(&key)
    }

    pub fn running_count(&self) -> usize {
        self.lock().len()
    }

    /// Runs the task on the caller's task. `None` when coalesced.
    pub async fn run(self: &Arc<Self>, key: TaskKey, task: Arc<dyn CoordinatedTask>) -> Option<Result<()>> {
        let guard = self.try_acquire(key)?;
        Some(self.drive(guard, task).await)
    }

    /// Spawns the task unless its key is busy.
    pub fn submit(self: &Arc<Self>, key: TaskKey, task: Arc<dyn CoordinatedTask>) -> (Submission, Option<JoinHandle<()>>) {
        let Some(guard) = self.try_acquire(key) else {
            debug!(?key, "coalesced submission into running task");
            return (Submission::Coalesced, None);
        };
        (Submission::Started, Some(self.spawn(guard, task)))
    }

    /// Like `submit`, but a busy key gets one follow-up run queued.
    pub fn submit_or_rerun(
        self: &Arc<Self>,
        key: TaskKey,
        task: Arc<dyn CoordinatedTask>,
    ) -> (Submission, Option<JoinHandle<()>>) {
        {
            let mut inflight = self.lock();
            if let Some(slot) = inflight.get_mut(&key) {
                slot.rerun = true;
                debug!(?key, "rerun queued behind running task");
                return (Submission::RerunQueued, None);
            }
        }
        self.submit(key, task)
    }

    fn spawn(self: &Arc<Self>, guard: InflightGuard, task: Arc<dyn CoordinatedTask>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let key = guard.key;
            if let Err(err) = coordinator.drive(guard, task).await {
                debug!(?key, error = %err, "coordinated task finished with error");
            }
        })
    }

    async fn drive(&self, guard: InflightGuard, task: Arc<dyn CoordinatedTask>) -> Result<()> {
        loop {
            let result = task.run().await;
            if !self.finish_or_rerun(&guard) {
                return result;
            }
            debug!(key = ?guard.key, "running requested follow-up");
        }
    }
}
