//! Coordination between controller instances sharing one metadata store.
//!
//! Mutations of the fleet are serialized by named locks under `/cluster/locks`. The
//! controller holding the registry lock publishes the brokers it knows under
//! `/cluster/register`; every controller watches that prefix.

use async_trait::async_trait;
use futures::StreamExt;
use gantry_core::metadata::{MetadataError, MetadataStore, WatchEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::control::{BrokerModelChangedListener, BrokerStatus};
use crate::errors::Result;
use crate::listeners::{ListenerId, ListenerList};
use crate::resources::{join_path, BASE_CONTROLLERS_PATH, BASE_LOCKS_PATH, BASE_REGISTER_PATH, SCALING_LOCK};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);
const REGISTRY_LOCK: &str = "registry";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub enabled: bool,
    /// Lock taken around every scale action.
    pub scaling_lock: String,
    pub lock_timeout_ms: u64,
    /// A lock whose holder died is released after this long.
    pub lock_ttl_seconds: u64,
    pub registry_ttl_seconds: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        CoordinationConfig {
            enabled: false,
            scaling_lock: SCALING_LOCK.to_string(),
            lock_timeout_ms: 5_000,
            lock_ttl_seconds: 60,
            registry_ttl_seconds: 30,
        }
    }
}

impl CoordinationConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_ttl_seconds)
    }
}

/// Named distributed locks owned by one controller instance.
pub struct ClusterCoordinator {
    store: Arc<dyn MetadataStore>,
    owner: String,
    config: CoordinationConfig,
}

impl ClusterCoordinator {
    pub fn new(store: Arc<dyn MetadataStore>, owner: impl Into<String>, config: CoordinationConfig) -> Self {
        ClusterCoordinator {
            store,
            owner: owner.into(),
            config,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Takes the lock `name`, retrying until `timeout`. Returns false if another
    /// controller still holds it. Taking a lock this controller already holds succeeds
    /// and renews its ttl.
    pub async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<bool> {
        let path = join_path(&[BASE_LOCKS_PATH, name]);
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .store
                .put_if_absent(&path, json!(self.owner), Some(self.config.lock_ttl()))
                .await
            {
                Ok(()) => {
                    debug!(lock = %path, owner = %self.owner, "lock acquired");
                    return Ok(true);
                }
                Err(MetadataError::KeyExists(_)) => {
                    if self.holds(&path).await? {
                        self.store
                            .put_with_ttl(&path, json!(self.owner), self.config.lock_ttl())
                            .await?;
                        return Ok(true);
                    }
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(lock = %path, owner = %self.owner, "lock still held elsewhere");
                return Ok(false);
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Releases `name` if this controller holds it.
    pub async fn release_lock(&self, name: &str) -> Result<()> {
        let path = join_path(&[BASE_LOCKS_PATH, name]);
        if self.holds(&path).await? {
            self.store.delete(&path).await?;
            debug!(lock = %path, owner = %self.owner, "lock released");
        }
        Ok(())
    }

    async fn holds(&self, path: &str) -> Result<bool> {
        let holder = self.store.get(path).await?;
        Ok(holder.as_ref().and_then(Value::as_str) == Some(self.owner.as_str()))
    }

    /// Announces this controller under `/cluster/controllers`.
    pub async fn register_controller(&self) -> Result<()> {
        let path = join_path(&[BASE_CONTROLLERS_PATH, &self.owner]);
        self.store
            .put_with_ttl(&path, json!({ "controller_id": self.owner }), self.config.registry_ttl())
            .await?;
        Ok(())
    }
}

/// Told when another controller adds or removes a broker in the shared registry.
#[async_trait]
pub trait BrokerChangeListener: Send + Sync {
    async fn broker_added(&self, broker_id: &str);
    async fn broker_removed(&self, broker_id: &str);
}

/// The shared broker registry under `/cluster/register`.
pub struct BrokerRegistry {
    coordinator: Arc<ClusterCoordinator>,
    listeners: ListenerList<dyn BrokerChangeListener>,
    published: Mutex<BTreeSet<String>>,
    latest: Mutex<Vec<BrokerStatus>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerRegistry {
    pub fn new(coordinator: Arc<ClusterCoordinator>) -> Self {
        BrokerRegistry {
            coordinator,
            listeners: ListenerList::new(),
            published: Mutex::new(BTreeSet::new()),
            latest: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn add_listener(&self, listener: Arc<dyn BrokerChangeListener>) -> ListenerId {
        self.listeners.add(listener).await
    }

    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id).await
    }

    /// Writes `brokers` as the canonical list if this controller holds the registry
    /// lock. Returns whether it did.
    pub async fn publish(&self, brokers: &[BrokerStatus]) -> Result<bool> {
        *self.latest.lock().await = brokers.to_vec();
        if !self
            .coordinator
            .acquire_lock(REGISTRY_LOCK, Duration::ZERO)
            .await?
        {
            debug!(owner = %self.coordinator.owner(), "registry lock held elsewhere, not publishing");
            return Ok(false);
        }

        let store = self.coordinator.store();
        let ttl = self.coordinator.config().registry_ttl();
        let mut published = self.published.lock().await;
        let current: BTreeSet<String> = brokers.iter().map(|b| b.broker_id.clone()).collect();

        for broker in brokers {
            let path = join_path(&[BASE_REGISTER_PATH, &broker.broker_id]);
            let payload = json!({
                "broker_name": broker.broker_name,
                "uri": broker.uri,
            });
            store.put_with_ttl(&path, payload, ttl).await?;
        }
        for gone in published.difference(&current) {
            store.delete(&join_path(&[BASE_REGISTER_PATH, gone])).await?;
            info!(broker_id = %gone, "broker unregistered from the cluster");
        }
        *published = current;
        Ok(true)
    }

    /// Starts the registry watch and the ttl renewal.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut stream = self.coordinator.store().watch(BASE_REGISTER_PATH).await?;
        let registry = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            let mut known = BTreeSet::new();
            while let Some(result) = stream.next().await {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                match result {
                    Ok(event) => registry.on_event(&mut known, event).await,
                    Err(MetadataError::WatchError(msg)) if msg.contains("lagged") => {
                        warn!("broker registry watch lagged, the next poll resynchronizes the fleet");
                    }
                    Err(e) => warn!(error = %e, "error receiving broker registry event"),
                }
            }
        });

        let registry = Arc::downgrade(self);
        let renew_interval = (self.coordinator.config().registry_ttl() / 3).max(Duration::from_millis(100));
        let renewer = tokio::spawn(async move {
            loop {
                tokio::time::sleep(renew_interval).await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if let Err(e) = registry.coordinator.register_controller().await {
                    error!(error = %e, "failed to renew controller registration");
                }
                let latest = registry.latest.lock().await.clone();
                if let Err(e) = registry.publish(&latest).await {
                    error!(error = %e, "failed to renew broker registry");
                }
            }
        });

        self.coordinator.register_controller().await?;
        let mut tasks = self.tasks.lock().await;
        tasks.push(watcher);
        tasks.push(renewer);
        Ok(())
    }

    async fn on_event(&self, known: &mut BTreeSet<String>, event: WatchEvent) {
        let Some(broker_id) = event.key().rsplit('/').next().map(str::to_string) else {
            return;
        };
        match event {
            WatchEvent::Put { .. } => {
                if known.insert(broker_id.clone()) {
                    debug!(broker_id = %broker_id, "broker registered");
                    for listener in self.listeners.snapshot().await {
                        listener.broker_added(&broker_id).await;
                    }
                }
            }
            WatchEvent::Delete { .. } => {
                if known.remove(&broker_id) {
                    debug!(broker_id = %broker_id, "broker deregistered");
                    for listener in self.listeners.snapshot().await {
                        listener.broker_removed(&broker_id).await;
                    }
                }
            }
        }
    }

    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Err(e) = self.coordinator.release_lock(REGISTRY_LOCK).await {
            warn!(error = %e, "failed to release registry lock");
        }
    }
}

#[async_trait]
impl BrokerModelChangedListener for BrokerRegistry {
    async fn brokers_changed(&self, brokers: &[BrokerStatus]) {
        match self.publish(brokers).await {
            Ok(true) => info!(brokers = brokers.len(), "broker registry updated"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to publish broker registry"),
        }
    }
}
