//! In-process broker fleet.
//!
//! Brokers here are plain in-memory queue sets. The fleet implements the management,
//! transport and migration boundaries, so the whole control plane can run against it
//! without a cluster. A broker's management root is its id.

use async_trait::async_trait;
use gantry_core::command::{Command, CommandKind, ConsumerId, Message, ObjectId, ProducerId};
use gantry_core::{BrokerOverview, Destination, DestinationOverview};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::{GantryError, Result};
use crate::management::{
    destination_object_name, matches_pattern, parse_destination, ManagementClient, BROKER_ID,
    BROKER_NAME, CONSUMER_COUNT, OPENWIRE_URL, PRODUCER_COUNT, QUEUE_SIZE, TOTAL_CONNECTIONS,
};
use crate::migration::{BrokerConnector, BrokerSession};
use crate::transport::{response_result, Connector, Transport, TransportListener, TransportOptions};

pub const LOCAL_SCHEME: &str = "local://";

#[derive(Default)]
struct LocalDestination {
    messages: VecDeque<Message>,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

struct TransportSlot {
    connected: Arc<AtomicBool>,
    listener: Weak<dyn TransportListener>,
}

impl LocalDestination {
    fn overview(&self, destination: &Destination) -> DestinationOverview {
        DestinationOverview::with_counters(
            destination.clone(),
            self.messages.len() as i64,
            self.producers.len() as u64,
            self.consumers.len() as u64,
        )
    }
}

#[derive(Default)]
struct LocalBroker {
    destinations: BTreeMap<Destination, LocalDestination>,
    transports: HashMap<u64, TransportSlot>,
}

impl LocalBroker {
    fn connection_count(&self) -> u64 {
        self.transports
            .values()
            .filter(|slot| slot.connected.load(Ordering::SeqCst))
            .count() as u64
    }
}

#[derive(Default)]
struct FleetState {
    brokers: BTreeMap<String, LocalBroker>,
    desired_replicas: usize,
    next_broker: u64,
    failing_sends: HashSet<String>,
}

/// A fleet of in-memory brokers addressed as `local://{broker_id}`.
#[derive(Clone, Default)]
pub struct LocalFleet {
    state: Arc<Mutex<FleetState>>,
    next_transport: Arc<AtomicU64>,
}

fn broker_id_of(uri: &str) -> Result<String> {
    uri.strip_prefix(LOCAL_SCHEME)
        .map(|rest| rest.split('?').next().unwrap_or_default().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| GantryError::Transport(format!("not a local broker uri: {}", uri)))
}

/// Marks each slot disconnected and tells its listener from a separate task.
fn disconnect(slots: impl IntoIterator<Item = TransportSlot>, reason: String) {
    for slot in slots {
        slot.connected.store(false, Ordering::SeqCst);
        if let Some(listener) = slot.listener.upgrade() {
            let reason = reason.clone();
            tokio::spawn(async move {
                listener.on_exception(GantryError::Transport(reason)).await;
            });
        }
    }
}

impl LocalFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `count` brokers and sets the desired replica count to match.
    pub async fn with_brokers(count: usize) -> Self {
        let fleet = Self::new();
        fleet.set_replicas(count).await;
        fleet
    }

    pub fn uri(broker_id: &str) -> String {
        format!("{}{}", LOCAL_SCHEME, broker_id)
    }

    pub async fn start_broker(&self) -> String {
        let mut state = self.state.lock().await;
        state.next_broker += 1;
        let broker_id = format!("broker-{}", state.next_broker);
        state.brokers.insert(broker_id.clone(), LocalBroker::default());
        info!(broker_id = %broker_id, "local broker started");
        broker_id
    }

    /// Kills a broker. Every transport to it is disconnected and its listener told.
    pub async fn stop_broker(&self, broker_id: &str) -> bool {
        let removed = self.state.lock().await.brokers.remove(broker_id);
        let Some(broker) = removed else {
            return false;
        };
        disconnect(broker.transports.into_values(), format!("broker {} stopped", broker_id));
        info!(broker_id = %broker_id, "local broker stopped");
        true
    }

    /// Cuts every transport into a running broker, as a network failure would.
    /// Returns how many were cut.
    pub async fn drop_transports(&self, broker_id: &str) -> usize {
        let slots: Vec<TransportSlot> = match self.state.lock().await.brokers.get_mut(broker_id) {
            Some(broker) => broker.transports.drain().map(|(_, slot)| slot).collect(),
            None => return 0,
        };
        let dropped = slots.len();
        disconnect(slots, format!("connection to {} reset", broker_id));
        debug!(broker_id = %broker_id, dropped, "local transports dropped");
        dropped
    }

    pub async fn desired_replicas(&self) -> usize {
        self.state.lock().await.desired_replicas
    }

    /// Records the desired replica count and starts brokers until it is met.
    /// Shrinking never picks a victim; brokers only go away through `stop_broker`.
    pub async fn set_replicas(&self, replicas: usize) {
        let missing = {
            let mut state = self.state.lock().await;
            state.desired_replicas = replicas;
            replicas.saturating_sub(state.brokers.len())
        };
        for _ in 0..missing {
            self.start_broker().await;
        }
    }

    pub async fn broker_ids(&self) -> Vec<String> {
        self.state.lock().await.brokers.keys().cloned().collect()
    }

    pub async fn broker_count(&self) -> usize {
        self.state.lock().await.brokers.len()
    }

    /// Makes every send into `broker_id` fail, or restores it.
    pub async fn fail_sends_to(&self, broker_id: &str, failing: bool) {
        let mut state = self.state.lock().await;
        if failing {
            state.failing_sends.insert(broker_id.to_string());
        } else {
            state.failing_sends.remove(broker_id);
        }
    }

    pub async fn enqueue(&self, broker_id: &str, message: Message) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_sends.contains(broker_id) {
            return Err(GantryError::Transport(format!("broker {} refused the message", broker_id)));
        }
        let broker = state
            .brokers
            .get_mut(broker_id)
            .ok_or_else(|| GantryError::Transport(format!("broker {} is not running", broker_id)))?;
        broker
            .destinations
            .entry(message.destination.clone())
            .or_default()
            .messages
            .push_back(message);
        Ok(())
    }

    pub async fn queue_depth(&self, broker_id: &str, destination: &Destination) -> Option<i64> {
        let state = self.state.lock().await;
        state
            .brokers
            .get(broker_id)?
            .destinations
            .get(destination)
            .map(|d| d.messages.len() as i64)
    }

    pub async fn messages(&self, broker_id: &str, destination: &Destination) -> Vec<Message> {
        let state = self.state.lock().await;
        state
            .brokers
            .get(broker_id)
            .and_then(|b| b.destinations.get(destination))
            .map(|d| d.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Management view of a broker, as a poll would read it.
    pub async fn overview(&self, broker_id: &str) -> Option<BrokerOverview> {
        let state = self.state.lock().await;
        let broker = state.brokers.get(broker_id)?;
        let mut overview = BrokerOverview::new(broker_id, broker_id);
        overview.total_connections = broker.connection_count();
        for (destination, local) in &broker.destinations {
            overview.add_destination(local.overview(destination));
        }
        Some(overview)
    }

    async fn apply(&self, broker_id: &str, command: &Command) -> Result<()> {
        if let CommandKind::Message(message) = &command.kind {
            return self.enqueue(broker_id, message.clone()).await;
        }

        let mut state = self.state.lock().await;
        let broker = state
            .brokers
            .get_mut(broker_id)
            .ok_or_else(|| GantryError::Transport(format!("broker {} is not running", broker_id)))?;
        match &command.kind {
            CommandKind::ProducerInfo(info) => {
                if let Some(destination) = &info.destination {
                    broker
                        .destinations
                        .entry(destination.clone())
                        .or_default()
                        .producers
                        .insert(info.producer_id.clone());
                }
            }
            CommandKind::ConsumerInfo(info) => {
                broker
                    .destinations
                    .entry(info.destination.clone())
                    .or_default()
                    .consumers
                    .insert(info.consumer_id.clone());
            }
            CommandKind::MessageAck(ack) => {
                if let Some(destination) = broker.destinations.get_mut(&ack.destination) {
                    for _ in 0..ack.message_count {
                        if destination.messages.pop_front().is_none() {
                            break;
                        }
                    }
                }
            }
            CommandKind::RemoveInfo(object_id) => {
                for destination in broker.destinations.values_mut() {
                    match object_id {
                        ObjectId::Connection(connection_id) => {
                            destination
                                .producers
                                .retain(|p| &p.session_id.connection_id != connection_id);
                            destination
                                .consumers
                                .retain(|c| &c.session_id.connection_id != connection_id);
                        }
                        ObjectId::Session(session_id) => {
                            destination.producers.retain(|p| &p.session_id != session_id);
                            destination.consumers.retain(|c| &c.session_id != session_id);
                        }
                        ObjectId::Consumer(consumer_id) => {
                            destination.consumers.remove(consumer_id);
                        }
                        ObjectId::Producer(producer_id) => {
                            destination.producers.remove(producer_id);
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn detach(&self, broker_id: &str, transport_id: u64) {
        if let Some(broker) = self.state.lock().await.brokers.get_mut(broker_id) {
            broker.transports.remove(&transport_id);
        }
    }
}

/// Transport into a `LocalFleet` broker. Commands are applied synchronously;
/// commands that require a response are answered through the listener.
pub struct LocalTransport {
    fleet: LocalFleet,
    broker_id: String,
    transport_id: u64,
    remote: String,
    connected: Arc<AtomicBool>,
    disposed: AtomicBool,
    listener: Arc<dyn TransportListener>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn oneway(&self, command: Command) -> Result<()> {
        if !self.is_connected() {
            return Err(GantryError::Transport(format!("transport to {} is not connected", self.remote)));
        }
        self.fleet.apply(&self.broker_id, &command).await?;
        if command.response_required {
            self.listener.on_command(Command::response(command.command_id)).await;
        }
        Ok(())
    }

    async fn request(&self, command: Command, _timeout: Duration) -> Result<Command> {
        if !self.is_connected() {
            return Err(GantryError::Transport(format!("transport to {} is not connected", self.remote)));
        }
        let response = match self.fleet.apply(&self.broker_id, &command).await {
            Ok(()) => Command::response(command.command_id),
            Err(e) => Command::exception(command.command_id, e.to_string()),
        };
        response_result(response)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.is_disposed()
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.fleet.detach(&self.broker_id, self.transport_id).await;
    }

    fn remote_address(&self) -> &str {
        &self.remote
    }
}

#[async_trait]
impl Connector for LocalFleet {
    async fn connect(
        &self,
        options: &TransportOptions,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn Transport>> {
        let broker_id = broker_id_of(&options.uri)?;
        let transport_id = self.next_transport.fetch_add(1, Ordering::SeqCst);
        let connected = Arc::new(AtomicBool::new(true));
        {
            let mut state = self.state.lock().await;
            let broker = state
                .brokers
                .get_mut(&broker_id)
                .ok_or_else(|| GantryError::Transport(format!("connection refused by {}", options)))?;
            broker.transports.insert(
                transport_id,
                TransportSlot {
                    connected: connected.clone(),
                    listener: Arc::downgrade(&listener),
                },
            );
        }
        debug!(broker_id = %broker_id, transport_id, "local transport connected");
        Ok(Arc::new(LocalTransport {
            fleet: self.clone(),
            remote: options.uri.clone(),
            broker_id,
            transport_id,
            connected,
            disposed: AtomicBool::new(false),
            listener,
        }))
    }
}

/// Migration session against one `LocalFleet` broker.
pub struct LocalSession {
    fleet: LocalFleet,
    broker_id: String,
}

#[async_trait]
impl BrokerSession for LocalSession {
    async fn receive(&mut self, destination: &Destination, _timeout: Duration) -> Result<Option<Message>> {
        // an empty in-memory queue cannot fill up while we wait
        let mut state = self.fleet.state.lock().await;
        let broker = state
            .brokers
            .get_mut(&self.broker_id)
            .ok_or_else(|| GantryError::Transport(format!("broker {} is not running", self.broker_id)))?;
        Ok(broker
            .destinations
            .get_mut(destination)
            .and_then(|d| d.messages.pop_front()))
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        self.fleet.enqueue(&self.broker_id, message).await
    }

    async fn remove_destination(&mut self, destination: &Destination) -> Result<()> {
        let mut state = self.fleet.state.lock().await;
        if let Some(broker) = state.brokers.get_mut(&self.broker_id) {
            let empty = broker
                .destinations
                .get(destination)
                .map_or(false, |d| d.messages.is_empty());
            if empty {
                broker.destinations.remove(destination);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for LocalFleet {
    async fn connect(&self, uri: &str) -> Result<Box<dyn BrokerSession>> {
        let broker_id = broker_id_of(uri)?;
        if !self.state.lock().await.brokers.contains_key(&broker_id) {
            return Err(GantryError::Transport(format!("broker {} is not running", broker_id)));
        }
        Ok(Box::new(LocalSession {
            fleet: self.clone(),
            broker_id,
        }))
    }
}

#[async_trait]
impl ManagementClient for LocalFleet {
    async fn read_attribute(&self, object_name: &str, attribute: &str) -> Result<Value> {
        let unknown = || GantryError::Collaborator(format!("no attribute {} on {}", attribute, object_name));
        let state = self.state.lock().await;

        if let Some((broker_id, destination)) = parse_destination(object_name) {
            let local = state
                .brokers
                .get(broker_id)
                .and_then(|b| b.destinations.get(&destination))
                .ok_or_else(unknown)?;
            return match attribute {
                PRODUCER_COUNT => Ok(json!(local.producers.len())),
                CONSUMER_COUNT => Ok(json!(local.consumers.len())),
                QUEUE_SIZE => Ok(json!(local.messages.len())),
                _ => Err(unknown()),
            };
        }

        let broker = state
            .brokers
            .get(object_name)
            .ok_or_else(|| GantryError::Collaborator(format!("broker {} is not running", object_name)))?;
        match attribute {
            BROKER_NAME | BROKER_ID => Ok(json!(object_name)),
            OPENWIRE_URL => Ok(json!(LocalFleet::uri(object_name))),
            TOTAL_CONNECTIONS => Ok(json!(broker.connection_count())),
            _ => Err(unknown()),
        }
    }

    async fn search_objects(&self, pattern: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .brokers
            .iter()
            .flat_map(|(broker_id, broker)| {
                broker
                    .destinations
                    .keys()
                    .map(move |destination| destination_object_name(broker_id, destination))
            })
            .filter(|object_name| matches_pattern(pattern, object_name))
            .collect())
    }
}
