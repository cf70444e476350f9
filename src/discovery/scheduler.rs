use super::deep::DeepDiscoveryTrigger;
use super::runner::{DiscoveryRunner, RunnerContext};
use crate::coordinator::{Submission, TaskCoordinator, TaskKey};
use crate::core::Result;
use crate::guard::StorageGuard;
use crate::health::AvailabilityListener;
use crate::registry::ServiceRegistry;
use crate::remote::{DeepDiscoveryLauncher, EventSubscriber};
use crate::transaction::run_in_transaction;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Recurring work scheduled for one service.
#[derive(Default)]
struct ScheduledTasks {
    polling: Option<JoinHandle<()>>,
    renewal: Option<JoinHandle<()>>,
    deep_discovery: Option<JoinHandle<()>>,
}

impl ScheduledTasks {
    fn abort(&mut self) {
        for handle in [
            self.polling.take(),
            self.renewal.take(),
            self.deep_discovery.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

impl Drop for ScheduledTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

/// What `schedule_with_event_subscription` set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// Already scheduled; nothing changed.
    AlreadyScheduled,
    /// Polling starts after one interval; events cover the gap.
    WithSubscription,
    /// Polling started immediately.
    PollingOnly,
    /// Canceled while the first pass was running.
    Canceled,
}

/// Per-service recurring discovery, deduplicated through the coordinator.
pub struct DiscoveryScheduler {
    context: RunnerContext,
    coordinator: Arc<TaskCoordinator>,
    subscriber: Arc<dyn EventSubscriber>,
    launcher: Arc<dyn DeepDiscoveryLauncher>,
    guard: Arc<StorageGuard>,
    registry: ServiceRegistry,
    tasks: RwLock<HashMap<Uuid, ScheduledTasks>>,
    runners: RwLock<HashMap<Uuid, Arc<DiscoveryRunner>>>,
}

impl DiscoveryScheduler {
    pub fn new(
        context: RunnerContext,
        coordinator: Arc<TaskCoordinator>,
        subscriber: Arc<dyn EventSubscriber>,
        launcher: Arc<dyn DeepDiscoveryLauncher>,
        guard: Arc<StorageGuard>,
    ) -> Self {
        Self {
            context,
            coordinator,
            subscriber,
            launcher,
            guard,
            registry: ServiceRegistry::new(),
            tasks: RwLock::new(HashMap::new()),
            runners: RwLock::new(HashMap::new()),
        }
    }

    /// Cached runner for the service, created on first use.
    pub async fn runner(&self, service_id: Uuid) -> Arc<DiscoveryRunner> {
        if let Some(runner) = self.runners.read().await.get(&service_id) {
            return Arc::clone(runner);
        }
        let mut runners = self.runners.write().await;
        Arc::clone(runners.entry(service_id).or_insert_with(|| {
            Arc::new(DiscoveryRunner::new(Some(service_id), self.context.clone()))
        }))
    }

    pub async fn cached_runners(&self) -> usize {
        self.runners.read().await.len()
    }

    pub async fn is_scheduled(&self, service_id: Uuid) -> bool {
        self.tasks.read().await.contains_key(&service_id)
    }

    pub async fn scheduled_services(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.tasks.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Runs one pass synchronously, subscribes to events, then starts the
    /// recurring work. Calling it again for a scheduled service is a no-op.
    pub async fn schedule_with_event_subscription(&self, service_id: Uuid) -> Result<Scheduled> {
        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&service_id) {
                return Ok(Scheduled::AlreadyScheduled);
            }
            tasks.insert(service_id, ScheduledTasks::default());
        }

        let runner = self.runner(service_id).await;
        let key = TaskKey::discovery(service_id);
        match self.coordinator.run(key, runner.clone()).await {
            Some(Err(err)) => debug!(%service_id, error = %err, "initial discovery pass failed"),
            Some(Ok(())) => {}
            None => debug!(%service_id, "initial discovery pass coalesced"),
        }

        let subscribed = self.subscribe(service_id).await;
        let period = self.context.config.discovery_interval_duration();
        let first_poll = if subscribed { period } else { Duration::ZERO };

        let mut scheduled = ScheduledTasks::default();
        scheduled.polling = Some(self.spawn_polling(service_id, runner, first_poll, period));
        if subscribed {
            scheduled.renewal = Some(self.spawn_renewal(service_id));
        }
        if self.context.config.deep_discovery_enabled {
            scheduled.deep_discovery = Some(self.spawn_deep_discovery(service_id));
        }

        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&service_id) {
            Some(slot) => {
                *slot = scheduled;
                info!(%service_id, subscribed, "discovery scheduled");
                Ok(if subscribed {
                    Scheduled::WithSubscription
                } else {
                    Scheduled::PollingOnly
                })
            }
            None => {
                // `scheduled` drops here and aborts what was just spawned.
                debug!(%service_id, "service canceled during initial pass");
                Ok(Scheduled::Canceled)
            }
        }
    }

    async fn subscribe(&self, service_id: Uuid) -> bool {
        let Some(service) = self.context.store.snapshot().await.service(service_id).cloned() else {
            return false;
        };
        match self.subscriber.subscribe(&service).await {
            Ok(subscribed) => subscribed,
            Err(err) => {
                warn!(%service_id, error = %err, "event subscription failed, falling back to polling");
                false
            }
        }
    }

    fn spawn_polling(
        &self,
        service_id: Uuid,
        runner: Arc<DiscoveryRunner>,
        first_poll: Duration,
        period: Duration,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + first_poll, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let (submission, _) = coordinator.submit(TaskKey::discovery(service_id), runner.clone());
                if submission == Submission::Coalesced {
                    debug!(%service_id, "previous pass still running, tick coalesced");
                }
            }
        })
    }

    fn spawn_renewal(&self, service_id: Uuid) -> JoinHandle<()> {
        let store = Arc::clone(&self.context.store);
        let subscriber = Arc::clone(&self.subscriber);
        let period = self.context.config.subscription_renewal_interval_duration();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(service) = store.snapshot().await.service(service_id).cloned() else {
                    break;
                };
                match subscriber.subscribe(&service).await {
                    Ok(true) => debug!(%service_id, "event subscription renewed"),
                    Ok(false) => debug!(%service_id, "service no longer accepts subscriptions"),
                    Err(err) => warn!(%service_id, error = %err, "event subscription renewal failed"),
                }
            }
        })
    }

    fn spawn_deep_discovery(&self, service_id: Uuid) -> JoinHandle<()> {
        let coordinator = Arc::clone(&self.coordinator);
        let trigger = Arc::new(DeepDiscoveryTrigger::new(
            service_id,
            Arc::clone(&self.context.store),
            self.context.config.transaction.clone(),
            Arc::clone(&self.guard),
            Arc::clone(&self.launcher),
        ));
        let period = self.context.config.deep_discovery_interval_duration();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                coordinator.submit(TaskKey::deep_discovery(service_id), trigger.clone());
            }
        })
    }

    /// Stops polling, renewal and deep discovery for the service and drops
    /// its runner. A pass in flight is asked to stop at its next checkpoint.
    pub async fn cancel(&self, service_id: Uuid) -> bool {
        let removed = self.tasks.write().await.remove(&service_id);
        if let Some(runner) = self.runners.write().await.remove(&service_id)
            && self.coordinator.is_running(TaskKey::discovery(service_id))
        {
            runner.request_cancel();
        }
        match removed {
            Some(mut tasks) => {
                tasks.abort();
                info!(%service_id, "discovery canceled");
                true
            }
            None => false,
        }
    }

    /// The service announced a change: mark it dirty and make sure a pass
    /// observes it, queueing one behind a running pass if needed.
    pub async fn on_event(&self, service_id: Uuid) -> Result<Submission> {
        let known = run_in_transaction(&self.context.store, &self.context.config.transaction, move |tx| async move {
            self.registry.mark_dirty(&tx, service_id, true).await
        })
        .await?;
        if !known {
            debug!(%service_id, "event for unknown service ignored");
            return Ok(Submission::Coalesced);
        }
        // Canceled services get no runner back; the dirty flag waits for
        // the pass that reschedules them.
        if !self.is_scheduled(service_id).await {
            debug!(%service_id, "event for unscheduled service recorded");
            return Ok(Submission::Coalesced);
        }

        let runner = self.runner(service_id).await;
        let (submission, _) = self
            .coordinator
            .submit_or_rerun(TaskKey::discovery(service_id), runner);
        Ok(submission)
    }

    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.tasks.read().await.keys().copied().collect();
        for service_id in ids {
            self.cancel(service_id).await;
        }
    }
}

#[async_trait]
impl AvailabilityListener for DiscoveryScheduler {
    async fn service_unreachable(&self, service_id: Uuid) {
        self.cancel(service_id).await;
    }

    async fn service_reachable(&self, service_id: Uuid) {
        if let Err(err) = self.schedule_with_event_subscription(service_id).await {
            warn!(%service_id, error = %err, "failed to reschedule recovered service");
        }
    }
}
