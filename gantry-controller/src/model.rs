//! Fleet-wide registry of brokers and of which broker owns each destination.

use gantry_core::{BrokerOverview, Destination};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::controller_metrics::{
    MIGRATIONS_COMPLETED_TOTAL, MIGRATIONS_FAILED_TOTAL, MIGRATIONS_STARTED_TOTAL,
    MIGRATION_DURATION_SECONDS,
};
use crate::distribution::DistributionId;
use crate::errors::{GantryError, Result};
use crate::migration::{BrokerConnector, DestinationWorker, MigrationConfig, MigrationKind};
use crate::scheduler::TaskExecutor;
use crate::transport::Transport;

mod broker_model;
mod broker_view;
mod policy;
mod snapshot;

pub use broker_model::BrokerModel;
pub use broker_view::{BrokerView, BrokerViewState};
pub use policy::{BrokerLimits, LoadPolicy, LoadWeights};
pub use snapshot::{BrokerSnapshot, ModelSnapshot};

/// The fleet registry.
///
/// Lock order: broker view locks (ascending broker id) before `assignments`, and
/// `brokers` is never held while awaiting a view lock.
pub struct Model {
    policy: Arc<LoadPolicy>,
    brokers: RwLock<BTreeMap<String, Arc<BrokerModel>>>,
    assignments: RwLock<HashMap<Destination, String>>,
    migration: MigrationConfig,
    broker_connector: Arc<dyn BrokerConnector>,
    executor: Arc<TaskExecutor>,
}

impl Model {
    pub fn new(
        policy: LoadPolicy,
        migration: MigrationConfig,
        broker_connector: Arc<dyn BrokerConnector>,
        executor: Arc<TaskExecutor>,
    ) -> Self {
        Model {
            policy: Arc::new(policy),
            brokers: RwLock::new(BTreeMap::new()),
            assignments: RwLock::new(HashMap::new()),
            migration,
            broker_connector,
            executor,
        }
    }

    pub fn policy(&self) -> Arc<LoadPolicy> {
        self.policy.clone()
    }

    pub async fn add_broker(&self, broker: Arc<BrokerModel>) {
        let overview = broker.overview().await;
        let broker_id = broker.broker_id().to_string();
        self.brokers.write().await.insert(broker_id.clone(), broker);
        self.assign_reported_destinations(&broker_id, &overview).await;
        info!(broker_id = %broker_id, "broker added to the fleet model");
    }

    /// Removes a broker that owns no destinations. Its destinations have to be
    /// migrated first.
    pub async fn remove_broker(&self, broker_id: &str) -> Result<Arc<BrokerModel>> {
        let owned = self.destinations_owned_by(broker_id).await;
        if !owned.is_empty() {
            return Err(GantryError::BrokerInUse(broker_id.to_string()));
        }
        let removed = self
            .brokers
            .write()
            .await
            .remove(broker_id)
            .ok_or(GantryError::NoBrokerAvailable)?;
        info!(broker_id = %broker_id, "broker removed from the fleet model");
        Ok(removed)
    }

    /// Drops a broker that disappeared on its own. Its destinations become
    /// unassigned and are reallocated on next use.
    pub async fn evict_broker(&self, broker_id: &str) -> Option<Arc<BrokerModel>> {
        let removed = self.brokers.write().await.remove(broker_id)?;
        let mut assignments = self.assignments.write().await;
        let before = assignments.len();
        assignments.retain(|_, owner| owner != broker_id);
        warn!(
            broker_id = %broker_id,
            unassigned = before - assignments.len(),
            "broker evicted from the fleet model"
        );
        Some(removed)
    }

    pub async fn get_broker_by_id(&self, broker_id: &str) -> Option<Arc<BrokerModel>> {
        self.brokers.read().await.get(broker_id).cloned()
    }

    pub async fn brokers(&self) -> Vec<Arc<BrokerModel>> {
        self.brokers.read().await.values().cloned().collect()
    }

    pub async fn broker_count(&self) -> usize {
        self.brokers.read().await.len()
    }

    pub async fn snapshot(&self) -> ModelSnapshot {
        let brokers = self.brokers().await;
        let mut overviews = Vec::with_capacity(brokers.len());
        for broker in brokers {
            overviews.push(broker.overview().await);
        }
        ModelSnapshot::new(self.policy.clone(), overviews)
    }

    pub async fn get_least_loaded_broker(&self) -> Option<Arc<BrokerModel>> {
        let snapshot = self.snapshot().await;
        let least = snapshot.least_loaded()?;
        self.get_broker_by_id(&least.broker_id).await
    }

    pub async fn get_most_loaded_broker(&self) -> Option<Arc<BrokerModel>> {
        let snapshot = self.snapshot().await;
        let most = snapshot.most_loaded()?;
        self.get_broker_by_id(&most.broker_id).await
    }

    pub async fn are_broker_limits_exceeded(&self, broker: &BrokerModel) -> bool {
        broker.are_broker_limits_exceeded().await
    }

    pub async fn are_destination_limits_exceeded(&self, broker: &BrokerModel) -> bool {
        broker.are_destination_limits_exceeded().await
    }

    pub async fn get_sorted_destinations(&self, broker: &BrokerModel, n: usize) -> Vec<Destination> {
        broker.sorted_destinations(n).await
    }

    pub async fn owner_of(&self, destination: &Destination) -> Option<String> {
        self.assignments.read().await.get(destination).cloned()
    }

    pub async fn destinations_owned_by(&self, broker_id: &str) -> Vec<Destination> {
        self.assignments
            .read()
            .await
            .iter()
            .filter(|(_, owner)| owner.as_str() == broker_id)
            .map(|(destination, _)| destination.clone())
            .collect()
    }

    /// Assigns destinations a broker reports that nobody owns yet. Existing owners are
    /// kept, so a migration source that still lists an emptied queue does not take
    /// it back.
    pub async fn assign_reported_destinations(&self, broker_id: &str, overview: &BrokerOverview) {
        let mut assignments = self.assignments.write().await;
        for destination in overview.destinations().map(|d| &d.destination) {
            if destination.is_internal() {
                continue;
            }
            assignments
                .entry(destination.clone())
                .or_insert_with(|| broker_id.to_string());
        }
    }

    /// The transport `distribution` uses for `destination`, assigning the destination
    /// to the least loaded broker when it has no owner yet.
    pub async fn get_transport(
        &self,
        distribution: DistributionId,
        destination: &Destination,
    ) -> Result<Arc<dyn Transport>> {
        let owner = self.owner_of(destination).await;
        let broker = match owner {
            Some(broker_id) => match self.get_broker_by_id(&broker_id).await {
                Some(broker) => broker,
                None => self.allocate(destination).await?,
            },
            None => self.allocate(destination).await?,
        };
        broker.view().transport_for(distribution).await.ok_or_else(|| {
            GantryError::Transport(format!(
                "no live transport from distribution {} to broker {}",
                distribution,
                broker.broker_id()
            ))
        })
    }

    async fn allocate(&self, destination: &Destination) -> Result<Arc<BrokerModel>> {
        let least = self
            .get_least_loaded_broker()
            .await
            .ok_or(GantryError::NoBrokerAvailable)?;
        let owner = {
            let mut assignments = self.assignments.write().await;
            let brokers = self.brokers.read().await;
            let current = assignments.get(destination).filter(|id| brokers.contains_key(*id)).cloned();
            match current {
                // lost the race to another sender
                Some(owner) => owner,
                None => {
                    assignments.insert(destination.clone(), least.broker_id().to_string());
                    debug!(destination = %destination, broker_id = %least.broker_id(), "destination assigned");
                    least.broker_id().to_string()
                }
            }
        };
        self.get_broker_by_id(&owner)
            .await
            .ok_or(GantryError::NoBrokerAvailable)
    }

    /// Live transports of `distribution`, one per broker.
    pub async fn transports_for(&self, distribution: DistributionId) -> Vec<(String, Arc<dyn Transport>)> {
        let mut transports = Vec::new();
        for broker in self.brokers().await {
            if let Some(transport) = broker.view().transport_for(distribution).await {
                transports.push((broker.broker_id().to_string(), transport));
            }
        }
        transports
    }

    /// Republishes the queued messages of `destinations` from `from` to `to` and
    /// makes `to` their owner. Returns false, with ownership untouched, on any worker
    /// error or when the copy timeout elapses.
    pub async fn copy_destinations(&self, from: &BrokerModel, to: &BrokerModel, destinations: &[Destination]) -> bool {
        self.migrate(from, to, destinations, MigrationKind::Copy).await
    }

    /// Like `copy_destinations`, and the drained destinations are deleted from `from`.
    pub async fn move_destinations(&self, from: &BrokerModel, to: &BrokerModel, destinations: &[Destination]) -> bool {
        self.migrate(from, to, destinations, MigrationKind::Move).await
    }

    async fn migrate(
        &self,
        from: &BrokerModel,
        to: &BrokerModel,
        destinations: &[Destination],
        kind: MigrationKind,
    ) -> bool {
        if destinations.is_empty() {
            return true;
        }

        // decision window: both brokers locked, only long enough to validate
        let (from_uri, to_uri) = {
            let (source, target) = match BrokerView::lock_pair(from.view(), to.view()).await {
                Ok(guards) => guards,
                Err(e) => {
                    warn!(error = %e, "migration refused");
                    return false;
                }
            };
            if !self.contains_both(from, to).await {
                warn!(from = %from.broker_id(), to = %to.broker_id(), "migration refused, broker left the fleet");
                return false;
            }
            (source.uri.clone(), target.uri.clone())
        };

        metrics::counter!(MIGRATIONS_STARTED_TOTAL.name).increment(1);
        let started = Instant::now();
        info!(
            from = %from.broker_id(),
            to = %to.broker_id(),
            destinations = destinations.len(),
            kind = ?kind,
            "migration started"
        );

        let worker = DestinationWorker::new(
            kind,
            self.broker_connector.clone(),
            from_uri,
            to_uri,
            destinations.to_vec(),
            self.migration.receive_timeout(),
        );
        let progress = worker.progress();

        // drain with no broker lock held
        let handle = match self.executor.submit(worker.run()) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "migration not scheduled");
                metrics::counter!(MIGRATIONS_FAILED_TOTAL.name).increment(1);
                return false;
            }
        };
        let outcome = tokio::time::timeout(self.migration.copy_timeout(), handle).await;
        let failure = match outcome {
            Ok(Ok(Ok(report))) => {
                debug!(messages = report.messages, "migration drained");
                None
            }
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(join_error)) => Some(join_error.to_string()),
            Err(_) => {
                progress.cancel();
                Some(format!(
                    "timed out after {:?} at {}%",
                    self.migration.copy_timeout(),
                    progress.percent_complete()
                ))
            }
        };
        if let Some(reason) = failure {
            metrics::counter!(MIGRATIONS_FAILED_TOTAL.name).increment(1);
            warn!(from = %from.broker_id(), to = %to.broker_id(), reason = %reason, "migration failed, ownership unchanged");
            return false;
        }

        // switch ownership under both locks
        let _guards = match BrokerView::lock_pair(from.view(), to.view()).await {
            Ok(guards) => guards,
            Err(_) => return false,
        };
        if !self.contains_both(from, to).await {
            metrics::counter!(MIGRATIONS_FAILED_TOTAL.name).increment(1);
            warn!(from = %from.broker_id(), to = %to.broker_id(), "broker left the fleet during migration, ownership unchanged");
            return false;
        }
        {
            let mut assignments = self.assignments.write().await;
            for destination in destinations {
                assignments.insert(destination.clone(), to.broker_id().to_string());
            }
        }

        metrics::counter!(MIGRATIONS_COMPLETED_TOTAL.name).increment(1);
        metrics::histogram!(MIGRATION_DURATION_SECONDS.name).record(started.elapsed().as_secs_f64());
        info!(
            from = %from.broker_id(),
            to = %to.broker_id(),
            destinations = destinations.len(),
            messages = progress.messages_moved(),
            "migration completed, routing switched"
        );
        true
    }

    async fn contains_both(&self, a: &BrokerModel, b: &BrokerModel) -> bool {
        let brokers = self.brokers.read().await;
        brokers.contains_key(a.broker_id()) && brokers.contains_key(b.broker_id())
    }
}

#[cfg(test)]
#[path = "model_test.rs"]
mod model_test;
