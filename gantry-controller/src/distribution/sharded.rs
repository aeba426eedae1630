use async_trait::async_trait;
use gantry_core::command::{Command, CommandKind};
use gantry_core::Destination;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, trace, warn};

use super::{
    ConnectionStateRegister, DistributionConfig, DistributionId, DistributionRegistry,
    MessageDistribution, RequestMap,
};
use crate::controller_metrics::ASYNC_REQUESTS_PENDING;
use crate::errors::{GantryError, Result};
use crate::model::Model;
use crate::transport::Transport;

pub(crate) const STOPPED_MESSAGE: &str = "message distribution stopped";
const EVICTED_MESSAGE: &str = "request evicted from the correlation cache";

/// Whether a distribution can route traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// No broker transport attached; sends wait.
    Unattached,
    Attached,
    /// Terminal.
    Stopped,
}

/// Aggregates the broker responses to one async request and answers the client once.
pub struct MultiCallback {
    client_command_id: u32,
    expected: usize,
    received: usize,
    failure: Option<String>,
    reply: oneshot::Sender<Command>,
}

impl MultiCallback {
    fn new(client_command_id: u32, expected: usize, reply: oneshot::Sender<Command>) -> Self {
        MultiCallback {
            client_command_id,
            expected,
            received: 0,
            failure: None,
            reply,
        }
    }

    /// Counts one broker response. Returns true once every expected broker answered.
    pub fn on_response(&mut self, response: &Command) -> bool {
        self.received += 1;
        if let CommandKind::ExceptionResponse { message, .. } = &response.kind {
            self.failure.get_or_insert_with(|| message.clone());
        }
        self.received >= self.expected
    }

    fn complete(self) {
        let response = match self.failure {
            Some(message) => Command::exception(self.client_command_id, message),
            None => Command::response(self.client_command_id),
        };
        // the caller may have given up waiting
        let _ = self.reply.send(response);
    }

    pub fn fail(self, message: &str) {
        let _ = self
            .reply
            .send(Command::exception(self.client_command_id, message));
    }
}

/// One client connection spread over the whole broker fleet.
///
/// Destination-bound commands go to the transport of the broker owning the destination;
/// connection, session, consumer and producer commands go to every broker and are
/// remembered so that brokers attached later get the same topology replayed.
pub struct ShardedMessageDistribution {
    id: DistributionId,
    model: Arc<Model>,
    config: DistributionConfig,
    readiness: watch::Sender<Readiness>,
    attached: Mutex<BTreeSet<String>>,
    state: Mutex<ConnectionStateRegister>,
    requests: Mutex<RequestMap<MultiCallback>>,
    next_request_id: AtomicU32,
    client: Option<mpsc::UnboundedSender<Command>>,
    registry: Option<Weak<dyn DistributionRegistry>>,
}

impl ShardedMessageDistribution {
    pub fn new(id: DistributionId, model: Arc<Model>, config: DistributionConfig) -> Self {
        let (readiness, _) = watch::channel(Readiness::Unattached);
        let requests = RequestMap::new(config.request_cache_size);
        ShardedMessageDistribution {
            id,
            model,
            config,
            readiness,
            attached: Mutex::new(BTreeSet::new()),
            state: Mutex::new(ConnectionStateRegister::new()),
            requests: Mutex::new(requests),
            next_request_id: AtomicU32::new(1),
            client: None,
            registry: None,
        }
    }

    /// Commands brokers send back, such as dispatches, are forwarded to `client`.
    pub fn with_client(mut self, client: mpsc::UnboundedSender<Command>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_registry(mut self, registry: Weak<dyn DistributionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.readiness() == Readiness::Stopped
    }

    pub async fn attached_brokers(&self) -> Vec<String> {
        self.attached.lock().await.iter().cloned().collect()
    }

    pub async fn pending_requests(&self) -> usize {
        self.requests.lock().await.len()
    }

    /// Waits until at least one broker is attached, up to the readiness timeout.
    pub async fn wait_for_broker(&self) -> Result<()> {
        let timeout = self.config.readiness_timeout();
        let mut readiness = self.readiness.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            readiness.wait_for(|state| *state != Readiness::Unattached),
        )
        .await;
        match waited {
            Err(_) => Err(GantryError::NotStarted(timeout)),
            Ok(Err(_)) => Err(GantryError::Stopped),
            Ok(Ok(state)) => match *state {
                Readiness::Stopped => Err(GantryError::Stopped),
                _ => Ok(()),
            },
        }
    }

    /// Forwards `command` one-way to the broker owning `destination`.
    pub async fn send(&self, destination: &Destination, command: Command) -> Result<()> {
        self.wait_for_broker().await?;
        let transport = self.model.get_transport(self.id, destination).await?;
        trace!(distribution = self.id, destination = %destination, command = %command, "routing command");
        transport.oneway(command).await
    }

    /// Forwards `command` to every attached broker. With `force` the readiness wait is
    /// skipped. A failed broker is logged and skipped; it gets the state replayed when
    /// its transport is rebuilt.
    pub async fn send_all(&self, command: Command, force: bool) -> Result<()> {
        if force {
            if self.is_stopped() {
                return Err(GantryError::Stopped);
            }
        } else {
            self.wait_for_broker().await?;
        }
        for (broker_id, transport) in self.model.transports_for(self.id).await {
            if let Err(e) = transport.oneway(command.clone()).await {
                warn!(distribution = self.id, broker_id = %broker_id, command = %command, error = %e, "broadcast to broker failed");
            }
        }
        Ok(())
    }

    /// Like `send`, and the returned receiver yields the broker's response carrying
    /// the client's command id.
    pub async fn async_send(
        &self,
        destination: &Destination,
        command: Command,
    ) -> Result<oneshot::Receiver<Command>> {
        self.wait_for_broker().await?;
        let transport = self.model.get_transport(self.id, destination).await?;
        let (request_id, receiver) = self.register_request(command.command_id, 1).await;
        self.dispatch_request(request_id, &transport, command).await;
        Ok(receiver)
    }

    /// Like `send_all`; the receiver yields one response once every broker answered,
    /// an exception if any of them failed.
    pub async fn async_send_all(&self, command: Command, force: bool) -> Result<oneshot::Receiver<Command>> {
        if force {
            if self.is_stopped() {
                return Err(GantryError::Stopped);
            }
        } else {
            self.wait_for_broker().await?;
        }
        let transports = self.model.transports_for(self.id).await;
        let (request_id, receiver) = self
            .register_request(command.command_id, transports.len().max(1))
            .await;
        if transports.is_empty() {
            self.complete_request(request_id, &Command::response(request_id)).await;
        }
        for (_, transport) in transports {
            self.dispatch_request(request_id, &transport, command.clone()).await;
        }
        Ok(receiver)
    }

    async fn register_request(&self, client_command_id: u32, expected: usize) -> (u32, oneshot::Receiver<Command>) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (reply, receiver) = oneshot::channel();
        let callback = MultiCallback::new(client_command_id, expected, reply);
        let evicted = self.requests.lock().await.insert(request_id, callback);
        match evicted {
            Some((evicted_id, callback)) => {
                warn!(distribution = self.id, request_id = evicted_id, "correlation cache full, oldest request failed");
                callback.fail(EVICTED_MESSAGE);
            }
            None => metrics::gauge!(ASYNC_REQUESTS_PENDING.name).increment(1.0),
        }
        (request_id, receiver)
    }

    async fn dispatch_request(&self, request_id: u32, transport: &Arc<dyn Transport>, mut command: Command) {
        command.command_id = request_id;
        command.response_required = true;
        if let Err(e) = transport.oneway(command).await {
            // a broker that cannot be reached counts as a failed response
            self.complete_request(request_id, &Command::exception(request_id, e.to_string()))
                .await;
        }
    }

    /// Feeds a response to its pending request. Returns false if no request matches.
    async fn complete_request(&self, request_id: u32, response: &Command) -> bool {
        let finished = {
            let mut requests = self.requests.lock().await;
            let done = match requests.get_mut(request_id) {
                Some(callback) => callback.on_response(response),
                None => return false,
            };
            if done {
                requests.remove(request_id)
            } else {
                None
            }
        };
        if let Some(callback) = finished {
            metrics::gauge!(ASYNC_REQUESTS_PENDING.name).decrement(1.0);
            callback.complete();
        }
        true
    }

    /// Routes a command received from the client.
    pub async fn on_client_command(&self, command: Command) -> Result<()> {
        match &command.kind {
            CommandKind::Message(_) | CommandKind::MessageAck(_) => {
                let Some(destination) = command.destination().cloned() else {
                    return Ok(());
                };
                if command.response_required {
                    let receiver = self.async_send(&destination, command).await?;
                    self.relay_reply(receiver);
                    Ok(())
                } else {
                    self.send(&destination, command).await
                }
            }
            CommandKind::ConnectionInfo(_)
            | CommandKind::SessionInfo(_)
            | CommandKind::ConsumerInfo(_)
            | CommandKind::ProducerInfo(_)
            | CommandKind::RemoveInfo(_) => {
                self.state.lock().await.track(&command);
                if command.response_required {
                    let receiver = self.async_send_all(command, false).await?;
                    self.relay_reply(receiver);
                    Ok(())
                } else {
                    self.send_all(command, false).await
                }
            }
            CommandKind::KeepAliveInfo => {
                if command.response_required {
                    self.to_client(Command::response(command.command_id));
                }
                Ok(())
            }
            CommandKind::ShutdownInfo => {
                self.stop().await;
                Ok(())
            }
            _ => {
                debug!(distribution = self.id, command = %command, "client command ignored");
                Ok(())
            }
        }
    }

    fn relay_reply(&self, receiver: oneshot::Receiver<Command>) {
        let Some(client) = self.client.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Ok(response) = receiver.await {
                let _ = client.send(response);
            }
        });
    }

    fn to_client(&self, command: Command) {
        match &self.client {
            Some(client) => {
                if client.send(command).is_err() {
                    debug!(distribution = self.id, "client gone, command dropped");
                }
            }
            None => trace!(distribution = self.id, command = %command, "no client attached, command dropped"),
        }
    }

    /// Stops routing. Pending async requests are answered with a "stopped" exception
    /// and the distribution deregisters itself. Idempotent.
    pub async fn stop(&self) {
        if self.readiness.send_replace(Readiness::Stopped) == Readiness::Stopped {
            return;
        }
        let pending = self.requests.lock().await.drain();
        let failed = pending.len();
        for (_, callback) in pending {
            callback.fail(STOPPED_MESSAGE);
        }
        metrics::gauge!(ASYNC_REQUESTS_PENDING.name).decrement(failed as f64);

        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.deregister_distribution(self.id).await;
        }
        info!(distribution = self.id, failed_requests = failed, "message distribution stopped");
    }
}

#[async_trait]
impl MessageDistribution for ShardedMessageDistribution {
    fn id(&self) -> DistributionId {
        self.id
    }

    async fn transport_created(&self, broker_id: &str, transport: Arc<dyn Transport>) -> Result<()> {
        if self.is_stopped() {
            return Err(GantryError::Stopped);
        }
        let replay = self.state.lock().await.replay_commands();
        let replayed = replay.len();
        for command in replay {
            if matches!(command.kind, CommandKind::ConnectionInfo(_)) {
                // the broker must accept the connection before sessions are created on it
                transport.request(command, self.config.request_timeout()).await?;
            } else {
                transport.oneway(command).await?;
            }
        }

        self.attached.lock().await.insert(broker_id.to_string());
        self.readiness.send_if_modified(|state| {
            if *state == Readiness::Unattached {
                *state = Readiness::Attached;
                true
            } else {
                false
            }
        });
        debug!(distribution = self.id, broker_id = %broker_id, replayed, "broker attached");
        Ok(())
    }

    async fn transport_destroyed(&self, broker_id: &str) {
        let remaining = {
            let mut attached = self.attached.lock().await;
            attached.remove(broker_id);
            attached.len()
        };
        if remaining == 0 {
            let reset = self.readiness.send_if_modified(|state| {
                if *state == Readiness::Attached {
                    *state = Readiness::Unattached;
                    true
                } else {
                    false
                }
            });
            if reset {
                info!(distribution = self.id, broker_id = %broker_id, "last broker detached, sends will wait");
            }
        }
    }

    async fn on_broker_command(&self, broker_id: &str, command: Command) {
        if let Some(correlation_id) = command.correlation_id() {
            if self.complete_request(correlation_id, &command).await {
                return;
            }
        }
        trace!(distribution = self.id, broker_id = %broker_id, command = %command, "broker command to client");
        self.to_client(command);
    }

    async fn shutdown(&self) {
        self.stop().await;
    }
}

#[cfg(test)]
#[path = "sharded_test.rs"]
mod sharded_test;
