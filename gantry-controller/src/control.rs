//! Reconciliation of the fleet model with the running brokers, and the scale actions
//! fired by the scaling engine.

use async_trait::async_trait;
use futures::FutureExt;
use gantry_core::Destination;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::coordination::{BrokerChangeListener, ClusterCoordinator};
use crate::controller_metrics::{
    BROKER_LOAD_PERCENT, BROKER_POLL_FAILURES_TOTAL, CLIENT_DISTRIBUTIONS, FLEET_BROKERS,
    POLL_CYCLE_DURATION_SECONDS, SCALE_DOWN_REQUESTS_TOTAL, SCALE_UP_REQUESTS_TOTAL,
};
use crate::distribution::{DistributionId, DistributionRegistry, MessageDistribution};
use crate::errors::{GantryError, Result};
use crate::listeners::{ListenerId, ListenerList};
use crate::model::{BrokerModel, BrokerView, Model};
use crate::scaling::{default_rules, ScalingAction, ScalingConfig, ScalingEngine, ScalingEventListener};
use crate::scheduler::{PeriodicTask, TaskExecutor};
use crate::transport::Connector;

pub mod kubernetes;
pub mod local;
mod scaling_guard;

pub use crate::management::BrokerStatus;
pub use scaling_guard::ScalingGuard;

/// Result of one poll of the running brokers.
#[derive(Debug, Clone, Default)]
pub struct BrokerPoll {
    pub statuses: Vec<BrokerStatus>,
    /// Brokers known to be running whose statistics could not be read this time.
    /// They stay in the model untouched until a later poll succeeds.
    pub unreachable: Vec<String>,
}

/// Told whenever a poll observes a different number of brokers.
#[async_trait]
pub trait BrokerModelChangedListener: Send + Sync {
    async fn brokers_changed(&self, brokers: &[BrokerStatus]);
}

/// The platform the brokers run on.
#[async_trait]
pub trait BrokerProvider: Send + Sync {
    async fn poll_brokers(&self) -> Result<BrokerPoll>;

    async fn desired_replicas(&self) -> Result<usize>;

    async fn set_desired_replicas(&self, replicas: usize) -> Result<()>;

    /// Removes one specific broker instance.
    async fn delete_broker(&self, broker_id: &str) -> Result<()>;

    /// How broker transports are opened on this platform.
    fn connector(&self) -> Arc<dyn Connector>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerControlConfig {
    pub poll_interval_ms: u64,
    /// Permits of the executor running migrations and rebalances.
    pub max_concurrent_tasks: usize,
}

impl Default for BrokerControlConfig {
    fn default() -> Self {
        BrokerControlConfig {
            poll_interval_ms: 5_000,
            max_concurrent_tasks: 32,
        }
    }
}

impl BrokerControlConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// A poll cycle running longer than two intervals is cancelled.
    pub fn max_poll_runtime(&self) -> Duration {
        self.poll_interval() * 2
    }
}

/// Drives the fleet: polls the brokers into the model, runs the scaling engine and
/// carries out its actions, and keeps every client distribution attached to every
/// broker.
pub struct BrokerControl {
    config: BrokerControlConfig,
    scaling: ScalingConfig,
    provider: Arc<dyn BrokerProvider>,
    model: Arc<Model>,
    engine: Arc<ScalingEngine>,
    guard: ScalingGuard,
    executor: Arc<TaskExecutor>,
    coordinator: Option<Arc<ClusterCoordinator>>,
    distributions: RwLock<BTreeMap<DistributionId, Arc<dyn MessageDistribution>>>,
    model_listeners: ListenerList<dyn BrokerModelChangedListener>,
    // destroyed brokers the platform may still report for a while
    retired: Mutex<HashSet<String>>,
    last_broker_count: AtomicUsize,
    rebalancing: AtomicBool,
    poll_trigger: Arc<Notify>,
    poller: Mutex<Option<PeriodicTask>>,
    self_ref: Weak<BrokerControl>,
}

struct ControlScalingListener {
    control: Weak<BrokerControl>,
}

#[async_trait]
impl ScalingEventListener for ControlScalingListener {
    async fn scale_up(&self) {
        if let Some(control) = self.control.upgrade() {
            if let Err(e) = control.scale_up().await {
                warn!(error = %e, "scale up abandoned for this cycle");
            }
        }
    }

    async fn scale_down(&self) {
        if let Some(control) = self.control.upgrade() {
            control.spawn_rebalance(ScalingAction::ScaleDown);
        }
    }

    async fn distribute_load(&self) {
        if let Some(control) = self.control.upgrade() {
            control.spawn_rebalance(ScalingAction::DistributeLoad);
        }
    }
}

impl BrokerControl {
    /// Builds the control and registers the default scaling rules with its engine.
    pub async fn new(
        config: BrokerControlConfig,
        scaling: ScalingConfig,
        provider: Arc<dyn BrokerProvider>,
        model: Arc<Model>,
        executor: Arc<TaskExecutor>,
        coordinator: Option<Arc<ClusterCoordinator>>,
    ) -> Arc<Self> {
        let engine = Arc::new(ScalingEngine::new(model.clone()));
        let control = Arc::new_cyclic(|self_ref| BrokerControl {
            guard: ScalingGuard::new(scaling.max_scaling_wait()),
            config,
            scaling,
            provider,
            model,
            engine,
            executor,
            coordinator,
            distributions: RwLock::new(BTreeMap::new()),
            model_listeners: ListenerList::new(),
            retired: Mutex::new(HashSet::new()),
            last_broker_count: AtomicUsize::new(0),
            rebalancing: AtomicBool::new(false),
            poll_trigger: Arc::new(Notify::new()),
            poller: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        for rule in default_rules(&control.scaling) {
            control.engine.add_rule(rule).await;
        }
        control
            .engine
            .add_listener(Arc::new(ControlScalingListener {
                control: Arc::downgrade(&control),
            }))
            .await;
        control
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn engine(&self) -> &Arc<ScalingEngine> {
        &self.engine
    }

    pub fn guard(&self) -> &ScalingGuard {
        &self.guard
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalancing.load(Ordering::SeqCst)
    }

    pub async fn add_model_listener(&self, listener: Arc<dyn BrokerModelChangedListener>) -> ListenerId {
        self.model_listeners.add(listener).await
    }

    pub async fn remove_model_listener(&self, id: ListenerId) -> bool {
        self.model_listeners.remove(id).await
    }

    /// Starts the periodic poll. The first cycle runs before this returns.
    pub async fn start(self: &Arc<Self>) {
        if let Err(e) = self.poll_cycle().await {
            warn!(error = %e, "initial broker poll failed");
        }
        let control = Arc::downgrade(self);
        let task = PeriodicTask::spawn(
            "broker-poll",
            self.config.poll_interval(),
            self.config.max_poll_runtime(),
            Some(self.poll_trigger.clone()),
            move || {
                let control = control.clone();
                async move {
                    let Some(control) = control.upgrade() else {
                        return;
                    };
                    if let Err(e) = control.poll_cycle().await {
                        debug!(error = %e, "poll cycle skipped");
                    }
                }
                .boxed()
            },
        );
        *self.poller.lock().await = Some(task);
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            brokers = self.model.broker_count().await,
            "broker control started"
        );
    }

    /// Stops polling, shuts every distribution down and detaches every broker.
    pub async fn stop(&self) {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.stop();
        }
        let distributions: Vec<_> = self.distributions.read().await.values().cloned().collect();
        for distribution in distributions {
            distribution.shutdown().await;
        }
        self.distributions.write().await.clear();
        for broker in self.model.brokers().await {
            broker.stop().await;
        }
        self.model_listeners.clear().await;
        info!("broker control stopped");
    }

    /// Runs the next poll cycle now instead of at the next tick.
    pub fn trigger_poll(&self) {
        self.poll_trigger.notify_one();
    }

    /// One reconciliation: poll, update the model, settle the scaling guard, run the
    /// rules and tell listeners about a changed fleet size.
    pub async fn poll_cycle(&self) -> Result<()> {
        let started = Instant::now();
        let poll = match self.provider.poll_brokers().await {
            Ok(poll) => poll,
            Err(e) => {
                metrics::counter!(BROKER_POLL_FAILURES_TOTAL.name).increment(1);
                warn!(error = %e, "broker poll failed, model left unchanged");
                return Err(e);
            }
        };
        self.reconcile(poll).await;

        let count = self.model.broker_count().await;
        metrics::gauge!(FLEET_BROKERS.name).set(count as f64);
        for broker in self.model.brokers().await {
            let load = broker.load().await;
            metrics::gauge!(BROKER_LOAD_PERCENT.name, "broker" => broker.broker_id().to_string()).set(load as f64);
        }

        self.guard.finished(count).await;
        self.engine.process().await;

        if self.last_broker_count.swap(count, Ordering::SeqCst) != count {
            let statuses = self.broker_statuses().await;
            for listener in self.model_listeners.snapshot().await {
                listener.brokers_changed(&statuses).await;
            }
        }

        metrics::histogram!(POLL_CYCLE_DURATION_SECONDS.name).record(started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn reconcile(&self, poll: BrokerPoll) {
        let distributions = self.registered_distributions().await;
        let mut seen = BTreeSet::new();
        {
            let mut retired = self.retired.lock().await;
            let reported: HashSet<&str> = poll
                .statuses
                .iter()
                .map(|s| s.broker_id.as_str())
                .chain(poll.unreachable.iter().map(String::as_str))
                .collect();
            retired.retain(|id| reported.contains(id.as_str()));
        }

        for status in poll.statuses {
            if self.retired.lock().await.contains(&status.broker_id) {
                continue;
            }
            seen.insert(status.broker_id.clone());
            match self.model.get_broker_by_id(&status.broker_id).await {
                Some(broker) => {
                    broker
                        .view()
                        .update(&status.broker_name, &status.uri, status.overview.clone())
                        .await;
                    let rebuilt = broker.view().update_transport().await;
                    if rebuilt > 0 {
                        info!(broker_id = %status.broker_id, rebuilt, "broker transports reconnected");
                    }
                    self.model
                        .assign_reported_destinations(&status.broker_id, &status.overview)
                        .await;
                }
                None => {
                    let view = BrokerView::new(
                        status.broker_id.as_str(),
                        status.broker_name.as_str(),
                        status.uri.as_str(),
                        self.provider.connector(),
                    );
                    view.update(&status.broker_name, &status.uri, status.overview).await;
                    let broker = Arc::new(BrokerModel::new(view, self.model.policy()));
                    self.model.add_broker(broker.clone()).await;
                    let attached = broker.start(distributions.clone()).await;
                    info!(
                        broker_id = %status.broker_id,
                        uri = %status.uri,
                        attached,
                        "broker joined the fleet"
                    );
                }
            }
        }

        for broker in self.model.brokers().await {
            let broker_id = broker.broker_id();
            if seen.contains(broker_id) || poll.unreachable.iter().any(|id| id == broker_id) {
                continue;
            }
            if let Some(evicted) = self.model.evict_broker(broker_id).await {
                evicted.stop().await;
            }
        }
    }

    async fn broker_statuses(&self) -> Vec<BrokerStatus> {
        let mut statuses = Vec::new();
        for broker in self.model.brokers().await {
            let state = broker.view().read().await;
            statuses.push(BrokerStatus {
                broker_id: broker.broker_id().to_string(),
                broker_name: state.broker_name.clone(),
                uri: state.uri.clone(),
                overview: state.overview.clone(),
            });
        }
        statuses
    }

    async fn registered_distributions(&self) -> Vec<Arc<dyn MessageDistribution>> {
        self.distributions.read().await.values().cloned().collect()
    }

    /// Registers a client distribution and connects it to every broker. Brokers that
    /// refuse the connection are retried by the next poll.
    pub async fn register_distribution(&self, distribution: Arc<dyn MessageDistribution>) {
        let id = distribution.id();
        let registered = {
            let mut distributions = self.distributions.write().await;
            distributions.insert(id, distribution.clone());
            distributions.len()
        };
        metrics::gauge!(CLIENT_DISTRIBUTIONS.name).set(registered as f64);

        let mut attached = 0;
        for broker in self.model.brokers().await {
            match broker.view().create_transport(distribution.clone()).await {
                Ok(()) => attached += 1,
                Err(e) => {
                    warn!(broker_id = %broker.broker_id(), distribution = id, error = %e, "transport not created, retrying next poll");
                }
            }
        }
        debug!(distribution = id, attached, "distribution registered");
    }

    pub async fn deregister_distribution(&self, id: DistributionId) {
        let removed = {
            let mut distributions = self.distributions.write().await;
            let removed = distributions.remove(&id).is_some();
            metrics::gauge!(CLIENT_DISTRIBUTIONS.name).set(distributions.len() as f64);
            removed
        };
        if !removed {
            return;
        }
        for broker in self.model.brokers().await {
            broker.view().remove_transport(id).await;
        }
        debug!(distribution = id, "distribution deregistered");
    }

    pub async fn distribution_count(&self) -> usize {
        self.distributions.read().await.len()
    }

    async fn lock_scaling(&self) -> Result<()> {
        let Some(coordinator) = &self.coordinator else {
            return Ok(());
        };
        let name = &coordinator.config().scaling_lock;
        if coordinator
            .acquire_lock(name, coordinator.config().lock_timeout())
            .await?
        {
            Ok(())
        } else {
            Err(GantryError::LockTimeout(name.clone()))
        }
    }

    async fn unlock_scaling(&self) {
        if let Some(coordinator) = &self.coordinator {
            if let Err(e) = coordinator.release_lock(&coordinator.config().scaling_lock).await {
                warn!(error = %e, "failed to release scaling lock");
            }
        }
    }

    /// Asks the platform for one more broker. Returns false when a scale operation is
    /// already in flight or the fleet is at its maximum size.
    pub async fn scale_up(&self) -> Result<bool> {
        let current = self.model.broker_count().await;
        if current >= self.scaling.max_brokers {
            debug!(brokers = current, max_brokers = self.scaling.max_brokers, "fleet at maximum size");
            return Ok(false);
        }
        let desired = current + 1;
        if !self.guard.start_work(desired).await {
            return Ok(false);
        }
        if let Err(e) = self.lock_scaling().await {
            self.guard.cancel().await;
            return Err(e);
        }
        let result = self.provider.set_desired_replicas(desired).await;
        self.unlock_scaling().await;

        match result {
            Ok(()) => {
                metrics::counter!(SCALE_UP_REQUESTS_TOTAL.name).increment(1);
                info!(from = current, to = desired, "scale up requested");
                Ok(true)
            }
            Err(e) => {
                // the guard expires on its own
                error!(desired, error = %e, "scale up request failed");
                Err(e)
            }
        }
    }

    /// Drains the least loaded broker into the next least loaded one and destroys it.
    /// Nothing is destroyed unless the drain succeeded.
    pub async fn scale_down(&self) -> Result<bool> {
        let snapshot = self.model.snapshot().await;
        let count = snapshot.broker_count();
        if count <= self.scaling.min_brokers.max(1) {
            return Ok(false);
        }
        let Some(least) = snapshot.least_loaded() else {
            return Ok(false);
        };
        let Some(next) = snapshot.next_least_loaded(&least.broker_id) else {
            return Ok(false);
        };
        let (Some(from), Some(to)) = (
            self.model.get_broker_by_id(&least.broker_id).await,
            self.model.get_broker_by_id(&next.broker_id).await,
        ) else {
            return Ok(false);
        };

        if !self.guard.start_work(count - 1).await {
            return Ok(false);
        }
        if let Err(e) = self.lock_scaling().await {
            self.guard.cancel().await;
            return Err(e);
        }
        let result = self.drain_and_destroy(&from, &to, count - 1).await;
        self.unlock_scaling().await;
        if result.is_err() {
            self.guard.cancel().await;
        }
        result.map(|()| true)
    }

    async fn drain_and_destroy(&self, from: &Arc<BrokerModel>, to: &Arc<BrokerModel>, desired: usize) -> Result<()> {
        let destinations = self.destinations_to_drain(from).await;
        info!(
            from = %from.broker_id(),
            to = %to.broker_id(),
            destinations = destinations.len(),
            "scale down: draining broker"
        );
        if !self.model.copy_destinations(from, to, &destinations).await {
            return Err(GantryError::MigrationFailed(format!(
                "draining {} into {}",
                from.broker_id(),
                to.broker_id()
            )));
        }
        self.destroy_broker(from, to, desired).await
    }

    /// Destinations `from` owns or reports without an owner.
    async fn destinations_to_drain(&self, from: &BrokerModel) -> Vec<Destination> {
        let mut destinations: BTreeSet<Destination> =
            self.model.destinations_owned_by(from.broker_id()).await.into_iter().collect();
        for destination in from.sorted_destinations(usize::MAX).await {
            if destination.is_internal() {
                continue;
            }
            if self.model.owner_of(&destination).await.is_none() {
                destinations.insert(destination);
            }
        }
        destinations.into_iter().collect()
    }

    async fn destroy_broker(&self, broker: &Arc<BrokerModel>, replacement: &Arc<BrokerModel>, desired: usize) -> Result<()> {
        let broker_id = broker.broker_id().to_string();
        self.model.remove_broker(&broker_id).await?;
        self.retired.lock().await.insert(broker_id.clone());

        let bindings = broker.view().detach_transports().await;
        let reattached = replacement.view().attach_transports(bindings).await;
        broker.stop().await;

        if let Err(e) = self.provider.set_desired_replicas(desired).await {
            error!(broker_id = %broker_id, desired, error = %e, "replica count not lowered");
        }
        if let Err(e) = self.provider.delete_broker(&broker_id).await {
            warn!(broker_id = %broker_id, error = %e, "broker instance not deleted, the platform picks the victim");
        }
        metrics::counter!(SCALE_DOWN_REQUESTS_TOTAL.name).increment(1);
        info!(broker_id = %broker_id, desired, reattached, "broker destroyed");
        Ok(())
    }

    /// Moves half the active-destination gap from the most to the least loaded broker,
    /// hottest destinations first.
    pub async fn distribute_load(&self) -> Result<bool> {
        if self.guard.is_working().await {
            return Ok(false);
        }
        let snapshot = self.model.snapshot().await;
        if snapshot.broker_count() < 2 {
            return Ok(false);
        }
        let (Some(most), Some(least)) = (snapshot.most_loaded(), snapshot.least_loaded()) else {
            return Ok(false);
        };
        if most.broker_id == least.broker_id
            || !snapshot.limits_exceeded(most)
            || snapshot.limits_exceeded(least)
        {
            return Ok(false);
        }
        let to_copy = snapshot.movable_destination_count(most, least);
        if to_copy == 0 {
            return Ok(false);
        }

        let mut candidates = Vec::with_capacity(to_copy);
        for destination in snapshot.hottest_destinations(most, usize::MAX) {
            if candidates.len() == to_copy {
                break;
            }
            match self.model.owner_of(&destination).await {
                Some(owner) if owner != most.broker_id => continue,
                _ => candidates.push(destination),
            }
        }
        if candidates.is_empty() {
            return Ok(false);
        }
        let (Some(from), Some(to)) = (
            self.model.get_broker_by_id(&most.broker_id).await,
            self.model.get_broker_by_id(&least.broker_id).await,
        ) else {
            return Ok(false);
        };

        self.lock_scaling().await?;
        let copied = self.model.copy_destinations(&from, &to, &candidates).await;
        self.unlock_scaling().await;
        if !copied {
            return Err(GantryError::MigrationFailed(format!(
                "rebalancing {} into {}",
                from.broker_id(),
                to.broker_id()
            )));
        }
        info!(
            from = %from.broker_id(),
            to = %to.broker_id(),
            destinations = candidates.len(),
            "load distributed"
        );
        Ok(true)
    }

    /// Runs a draining action on the executor. One at a time; a request while another
    /// runs is dropped and re-evaluated by the next poll.
    fn spawn_rebalance(&self, action: ScalingAction) {
        let Some(control) = self.self_ref.upgrade() else {
            return;
        };
        if self.rebalancing.swap(true, Ordering::SeqCst) {
            debug!(action = %action, "rebalance already running");
            return;
        }
        let submitted = self.executor.submit(async move {
            let result = match action {
                ScalingAction::ScaleDown => control.scale_down().await,
                ScalingAction::DistributeLoad => control.distribute_load().await,
                ScalingAction::ScaleUp => control.scale_up().await,
            };
            control.rebalancing.store(false, Ordering::SeqCst);
            match result {
                Ok(true) => control.trigger_poll(),
                Ok(false) => debug!(action = %action, "nothing to do"),
                Err(e) => warn!(action = %action, error = %e, "scaling action abandoned for this cycle"),
            }
        });
        if let Err(e) = submitted {
            self.rebalancing.store(false, Ordering::SeqCst);
            warn!(action = %action, error = %e, "scaling action not scheduled");
        }
    }
}

#[async_trait]
impl DistributionRegistry for BrokerControl {
    async fn deregister_distribution(&self, id: DistributionId) {
        BrokerControl::deregister_distribution(self, id).await;
    }
}

#[async_trait]
impl BrokerChangeListener for BrokerControl {
    async fn broker_added(&self, broker_id: &str) {
        debug!(broker_id = %broker_id, "broker added by another controller");
        self.trigger_poll();
    }

    async fn broker_removed(&self, broker_id: &str) {
        debug!(broker_id = %broker_id, "broker removed by another controller");
        self.trigger_poll();
    }
}

#[cfg(test)]
#[path = "control_test.rs"]
mod control_test;
