use async_trait::async_trait;
use gantry_core::command::Command;
use gantry_core::BrokerOverview;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::controller_metrics::{TRANSPORTS_CREATED_TOTAL, TRANSPORTS_DESTROYED_TOTAL};
use crate::distribution::{DistributionId, MessageDistribution};
use crate::errors::{GantryError, Result};
use crate::transport::{Connector, Transport, TransportListener, TransportOptions};

struct Registration {
    distribution: Arc<dyn MessageDistribution>,
    transport: Option<Arc<dyn Transport>>,
    /// A connect is in flight for this registration.
    connecting: bool,
    /// Bumped whenever the slot is claimed or invalidated; an in-flight connect only
    /// installs its transport if the generation it started with is still current.
    generation: u64,
}

impl Registration {
    fn is_live(&self) -> bool {
        self.transport
            .as_ref()
            .map_or(false, |t| t.is_connected() && !t.is_disposed())
    }
}

/// Everything guarded by a broker's read/write lock.
pub struct BrokerViewState {
    pub broker_name: String,
    pub uri: String,
    pub overview: BrokerOverview,
    registrations: HashMap<DistributionId, Registration>,
    next_generation: u64,
}

impl BrokerViewState {
    /// Live transport of a distribution, if it has one.
    pub fn transport(&self, distribution: DistributionId) -> Option<Arc<dyn Transport>> {
        self.registrations
            .get(&distribution)
            .filter(|r| r.is_live())
            .and_then(|r| r.transport.clone())
    }

    pub fn live_transport_count(&self) -> usize {
        self.registrations.values().filter(|r| r.is_live()).count()
    }

    pub fn registered_distributions(&self) -> usize {
        self.registrations.len()
    }

    fn claim(&mut self, distribution: DistributionId) -> Option<(u64, Option<Arc<dyn Transport>>)> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let registration = self.registrations.get_mut(&distribution)?;
        registration.connecting = true;
        registration.generation = generation;
        Some((generation, registration.transport.take()))
    }
}

/// Live state of one broker: identity, latest overview and one outbound transport
/// per registered client distribution.
///
/// Registrations outlive their transports. A transport that fails or was never
/// established leaves an empty slot that `update_transport` fills on the next poll.
pub struct BrokerView {
    broker_id: String,
    connector: Arc<dyn Connector>,
    state: RwLock<BrokerViewState>,
    stopped: AtomicBool,
}

impl BrokerView {
    pub fn new(
        broker_id: impl Into<String>,
        broker_name: impl Into<String>,
        uri: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let broker_id = broker_id.into();
        let broker_name = broker_name.into();
        Arc::new(BrokerView {
            state: RwLock::new(BrokerViewState {
                overview: BrokerOverview::new(broker_id.clone(), broker_name.clone()),
                broker_name,
                uri: uri.into(),
                registrations: HashMap::new(),
                next_generation: 0,
            }),
            broker_id,
            connector,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, BrokerViewState> {
        self.state.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, BrokerViewState> {
        self.state.write().await
    }

    /// Write-locks two distinct brokers in ascending broker id order. The guards are
    /// returned in argument order.
    pub async fn lock_pair<'a>(
        first: &'a BrokerView,
        second: &'a BrokerView,
    ) -> Result<(
        RwLockWriteGuard<'a, BrokerViewState>,
        RwLockWriteGuard<'a, BrokerViewState>,
    )> {
        if first.broker_id == second.broker_id {
            return Err(GantryError::MigrationFailed(format!(
                "cannot pair broker {} with itself",
                first.broker_id
            )));
        }
        if first.broker_id < second.broker_id {
            let a = first.write().await;
            let b = second.write().await;
            Ok((a, b))
        } else {
            let b = second.write().await;
            let a = first.write().await;
            Ok((a, b))
        }
    }

    pub async fn overview(&self) -> BrokerOverview {
        self.read().await.overview.clone()
    }

    pub async fn uri(&self) -> String {
        self.read().await.uri.clone()
    }

    /// Installs a freshly polled overview, deriving each destination's depth rate from
    /// the overview it replaces. A changed URI invalidates every transport, including
    /// connects still in flight; they are rebuilt by the following `update_transport`.
    pub async fn update(&self, broker_name: &str, uri: &str, mut overview: BrokerOverview) {
        let stale = {
            let mut state = self.write().await;
            let previous = &state.overview;
            for destination in overview
                .queue_overviews
                .values_mut()
                .chain(overview.topic_overviews.values_mut())
            {
                let old_depth = previous.get(&destination.destination).map_or(0, |d| d.queue_depth);
                destination.queue_depth_rate = destination.queue_depth - old_depth;
            }
            state.broker_name = broker_name.to_string();
            state.overview = overview;
            if state.uri == uri {
                Vec::new()
            } else {
                info!(broker_id = %self.broker_id, old_uri = %state.uri, new_uri = %uri, "broker uri changed");
                state.uri = uri.to_string();
                state.next_generation += 1;
                let generation = state.next_generation;
                let mut stale = Vec::new();
                for registration in state.registrations.values_mut() {
                    if registration.connecting {
                        registration.connecting = false;
                        registration.generation = generation;
                    }
                    if let Some(transport) = registration.transport.take() {
                        stale.push((registration.distribution.clone(), transport));
                    }
                }
                stale
            }
        };
        for (distribution, transport) in stale {
            self.destroy(&distribution, transport).await;
        }
    }

    pub async fn transport_for(&self, distribution: DistributionId) -> Option<Arc<dyn Transport>> {
        self.read().await.transport(distribution)
    }

    /// Registers `distribution` and connects it to this broker.
    ///
    /// The broker lock is only held to claim the registration and to install the
    /// result; the connect and the client state replay run without it. On failure the
    /// registration is kept without a transport so that the next `update_transport`
    /// retries it.
    pub async fn create_transport(self: &Arc<Self>, distribution: Arc<dyn MessageDistribution>) -> Result<()> {
        if self.is_stopped() {
            return Err(GantryError::Transport(format!("broker {} is stopped", self.broker_id)));
        }
        let id = distribution.id();
        let (uri, generation, replaced) = {
            let mut state = self.write().await;
            if let Some(registration) = state.registrations.get(&id) {
                if registration.is_live() || registration.connecting {
                    return Ok(());
                }
            }
            state.registrations.entry(id).or_insert_with(|| Registration {
                distribution: distribution.clone(),
                transport: None,
                connecting: false,
                generation: 0,
            });
            let Some((generation, replaced)) = state.claim(id) else {
                return Ok(());
            };
            (state.uri.clone(), generation, replaced)
        };
        if let Some(transport) = replaced {
            self.destroy(&distribution, transport).await;
        }
        let outcome = self.connect(&uri, distribution.clone()).await;
        self.install(id, generation, &distribution, outcome).await
    }

    async fn connect(
        self: &Arc<Self>,
        uri: &str,
        distribution: Arc<dyn MessageDistribution>,
    ) -> Result<Arc<dyn Transport>> {
        let options = TransportOptions::for_broker(uri);
        let listener = Arc::new(ViewTransportListener {
            view: Arc::downgrade(self),
            broker_id: self.broker_id.clone(),
            distribution: distribution.clone(),
        });
        let transport = self.connector.connect(&options, listener).await?;

        // replay of the client's state must complete before the transport is usable
        if let Err(e) = distribution.transport_created(&self.broker_id, transport.clone()).await {
            transport.stop().await;
            distribution.transport_destroyed(&self.broker_id).await;
            return Err(e);
        }

        metrics::counter!(TRANSPORTS_CREATED_TOTAL.name, "broker" => self.broker_id.clone()).increment(1);
        debug!(
            broker_id = %self.broker_id,
            distribution = distribution.id(),
            uri = %options,
            "broker transport created"
        );
        Ok(transport)
    }

    /// Hands the outcome of a connect back to its registration. A registration that
    /// was removed or invalidated meanwhile does not get the transport.
    async fn install(
        &self,
        id: DistributionId,
        generation: u64,
        distribution: &Arc<dyn MessageDistribution>,
        outcome: Result<Arc<dyn Transport>>,
    ) -> Result<()> {
        let mut state = self.write().await;
        let current = state.registrations.get_mut(&id);
        let superseded_by_live = match current {
            Some(registration) if registration.generation == generation => {
                registration.connecting = false;
                let transport = outcome?;
                registration.transport = Some(transport);
                return Ok(());
            }
            Some(registration) => registration.is_live() || registration.connecting,
            None => false,
        };
        drop(state);

        let transport = outcome?;
        transport.stop().await;
        metrics::counter!(TRANSPORTS_DESTROYED_TOTAL.name, "broker" => self.broker_id.clone()).increment(1);
        // a live or connecting successor keeps the broker attached
        if !superseded_by_live {
            distribution.transport_destroyed(&self.broker_id).await;
        }
        Err(GantryError::Transport(format!(
            "registration of distribution {} on broker {} changed while connecting",
            id, self.broker_id
        )))
    }

    /// Stops and forgets the transport of `distribution`. Idempotent.
    pub async fn remove_transport(&self, distribution: DistributionId) {
        let removed = self.write().await.registrations.remove(&distribution);
        if let Some(registration) = removed {
            self.release(registration).await;
        }
    }

    /// Recreates every missing, disconnected or disposed transport. Returns how many
    /// transports were rebuilt.
    ///
    /// Registrations are claimed under the lock; each reconnect then runs without it,
    /// so traffic through the healthy transports of this broker is not held up.
    pub async fn update_transport(self: &Arc<Self>) -> usize {
        if self.is_stopped() {
            return 0;
        }
        let (uri, claimed) = {
            let mut state = self.write().await;
            let stale: Vec<(DistributionId, Arc<dyn MessageDistribution>)> = state
                .registrations
                .iter()
                .filter(|(_, r)| !r.is_live() && !r.connecting)
                .map(|(id, r)| (*id, r.distribution.clone()))
                .collect();
            let mut claimed = Vec::with_capacity(stale.len());
            for (id, distribution) in stale {
                if let Some((generation, dead)) = state.claim(id) {
                    claimed.push((id, generation, distribution, dead));
                }
            }
            (state.uri.clone(), claimed)
        };

        let mut rebuilt = 0;
        for (id, generation, distribution, dead) in claimed {
            if let Some(transport) = dead {
                self.destroy(&distribution, transport).await;
            }
            let outcome = self.connect(&uri, distribution.clone()).await;
            match self.install(id, generation, &distribution, outcome).await {
                Ok(()) => rebuilt += 1,
                Err(e) => {
                    warn!(broker_id = %self.broker_id, distribution = id, error = %e, "transport reconnect failed, retrying next poll");
                }
            }
        }
        rebuilt
    }

    /// Stops every transport and hands back the distributions that were registered.
    pub async fn detach_transports(&self) -> Vec<Arc<dyn MessageDistribution>> {
        let registrations: Vec<Registration> = self
            .write()
            .await
            .registrations
            .drain()
            .map(|(_, r)| r)
            .collect();
        let mut distributions = Vec::with_capacity(registrations.len());
        for registration in registrations {
            distributions.push(registration.distribution.clone());
            self.release(registration).await;
        }
        distributions
    }

    /// Connects each distribution, tolerating individual failures.
    pub async fn attach_transports(self: &Arc<Self>, distributions: Vec<Arc<dyn MessageDistribution>>) -> usize {
        let mut attached = 0;
        for distribution in distributions {
            let id = distribution.id();
            match self.create_transport(distribution).await {
                Ok(()) => attached += 1,
                Err(e) => {
                    warn!(broker_id = %self.broker_id, distribution = id, error = %e, "attach failed, retrying next poll");
                }
            }
        }
        attached
    }

    /// Detaches everything. Later calls to `create_transport` are refused.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let detached = self.detach_transports().await;
        info!(broker_id = %self.broker_id, detached = detached.len(), "broker view stopped");
    }

    async fn release(&self, registration: Registration) {
        match registration.transport {
            Some(transport) => self.destroy(&registration.distribution, transport).await,
            None => registration.distribution.transport_destroyed(&self.broker_id).await,
        }
    }

    /// Stops a transport that left its registration and detaches the broker from
    /// the distribution.
    async fn destroy(&self, distribution: &Arc<dyn MessageDistribution>, transport: Arc<dyn Transport>) {
        transport.stop().await;
        metrics::counter!(TRANSPORTS_DESTROYED_TOTAL.name, "broker" => self.broker_id.clone()).increment(1);
        distribution.transport_destroyed(&self.broker_id).await;
    }

    async fn transport_lost(&self, distribution: &Arc<dyn MessageDistribution>, error: &GantryError) {
        let dropped = {
            let mut state = self.write().await;
            match state.registrations.get_mut(&distribution.id()) {
                Some(registration) if !registration.is_live() => registration.transport.take(),
                _ => None,
            }
        };
        if let Some(transport) = dropped {
            warn!(broker_id = %self.broker_id, distribution = distribution.id(), error = %error, "broker transport lost");
            self.destroy(distribution, transport).await;
        }
    }
}

struct ViewTransportListener {
    view: Weak<BrokerView>,
    broker_id: String,
    distribution: Arc<dyn MessageDistribution>,
}

#[async_trait]
impl TransportListener for ViewTransportListener {
    async fn on_command(&self, command: Command) {
        self.distribution.on_broker_command(&self.broker_id, command).await;
    }

    async fn on_exception(&self, error: GantryError) {
        match self.view.upgrade() {
            Some(view) => view.transport_lost(&self.distribution, &error).await,
            None => self.distribution.transport_destroyed(&self.broker_id).await,
        }
    }
}
