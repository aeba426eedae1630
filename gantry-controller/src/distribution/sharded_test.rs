use async_trait::async_trait;
use gantry_core::command::{
    Command, CommandKind, ConnectionId, ConnectionInfo, ConsumerInfo, Message, ProducerInfo, SessionInfo,
};
use gantry_core::{BrokerOverview, Destination};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::*;
use crate::errors::{GantryError, Result};
use crate::local::LocalFleet;
use crate::migration::MigrationConfig;
use crate::model::{BrokerModel, BrokerView, LoadPolicy, Model};
use crate::scheduler::TaskExecutor;
use crate::transport::{Connector, Transport, TransportListener, TransportOptions};

/// Transport that records what it is given and never answers a oneway.
struct SilentTransport {
    remote: String,
    sent: Arc<Mutex<Vec<Command>>>,
    stopped: AtomicBool,
}

#[async_trait]
impl Transport for SilentTransport {
    async fn oneway(&self, command: Command) -> Result<()> {
        self.sent.lock().await.push(command);
        Ok(())
    }

    async fn request(&self, command: Command, _timeout: Duration) -> Result<Command> {
        let id = command.command_id;
        self.sent.lock().await.push(command);
        Ok(Command::response(id))
    }

    fn is_connected(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    fn is_disposed(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn remote_address(&self) -> &str {
        &self.remote
    }
}

#[derive(Default)]
struct SilentConnector {
    sent: Arc<Mutex<Vec<Command>>>,
}

#[async_trait]
impl Connector for SilentConnector {
    async fn connect(
        &self,
        options: &TransportOptions,
        _listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(SilentTransport {
            remote: options.uri.clone(),
            sent: self.sent.clone(),
            stopped: AtomicBool::new(false),
        }))
    }
}

/// Connector whose later connects can be slowed down or refused. It keeps every
/// listener it hands out so a test can report a transport failure.
#[derive(Default)]
struct FlakyConnector {
    inner: SilentConnector,
    refusing: AtomicBool,
    delay_ms: AtomicU64,
    listeners: Mutex<Vec<Arc<dyn TransportListener>>>,
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(
        &self,
        options: &TransportOptions,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn Transport>> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.refusing.load(Ordering::SeqCst) {
            return Err(GantryError::Transport(format!("connection refused by {}", options)));
        }
        self.listeners.lock().await.push(listener.clone());
        self.inner.connect(options, listener).await
    }
}

fn model() -> Arc<Model> {
    Arc::new(Model::new(
        LoadPolicy::default(),
        MigrationConfig::default(),
        Arc::new(LocalFleet::new()),
        Arc::new(TaskExecutor::new("test", 4)),
    ))
}

async fn add_silent_broker(model: &Model, broker_id: &str) -> (Arc<BrokerModel>, Arc<Mutex<Vec<Command>>>) {
    let connector = SilentConnector::default();
    let sent = connector.sent.clone();
    let view = BrokerView::new(broker_id, broker_id, format!("tcp://{}:61616", broker_id), Arc::new(connector));
    let broker = Arc::new(BrokerModel::new(view, model.policy()));
    model.add_broker(broker.clone()).await;
    (broker, sent)
}

async fn add_flaky_broker(model: &Model, broker_id: &str) -> (Arc<BrokerModel>, Arc<FlakyConnector>) {
    let connector = Arc::new(FlakyConnector::default());
    let view = BrokerView::new(broker_id, broker_id, format!("tcp://{}:61616", broker_id), connector.clone());
    let broker = Arc::new(BrokerModel::new(view, model.policy()));
    model.add_broker(broker.clone()).await;
    (broker, connector)
}

fn config(readiness_timeout_ms: u64) -> DistributionConfig {
    DistributionConfig {
        readiness_timeout_ms,
        ..Default::default()
    }
}

fn message(id: u32, queue: &str) -> Command {
    Command::new(
        id,
        CommandKind::Message(Message::new(format!("m-{}", id), Destination::queue(queue), b"payload".to_vec())),
    )
}

/// **Test:** Readiness gate across attach and detach.
///
/// **Reason:** A distribution must not route before a broker is attached, and must
/// block again once the last broker goes away.
///
/// **Expectation:** A pending send completes only after `transport_created`; after the
/// last transport is destroyed a new send blocks.
#[tokio::test]
async fn send_waits_for_first_broker_and_blocks_after_last_detach() {
    let model = model();
    let (broker, sent) = add_silent_broker(&model, "broker-1").await;
    let distribution = Arc::new(ShardedMessageDistribution::new(1, model.clone(), config(5_000)));
    assert_eq!(distribution.readiness(), Readiness::Unattached);

    let pending = {
        let distribution = distribution.clone();
        tokio::spawn(async move { distribution.send(&Destination::queue("orders"), message(1, "orders")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());
    assert!(sent.lock().await.is_empty());

    broker.view().create_transport(distribution.clone()).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(distribution.readiness(), Readiness::Attached);
    assert_eq!(sent.lock().await.len(), 1);

    broker.view().remove_transport(distribution.id()).await;
    assert_eq!(distribution.readiness(), Readiness::Unattached);
    let blocked = tokio::time::timeout(
        Duration::from_millis(100),
        distribution.send(&Destination::queue("orders"), message(2, "orders")),
    )
    .await;
    assert!(blocked.is_err());
}

#[tokio::test]
async fn readiness_timeout_reports_not_started() {
    let model = model();
    let distribution = ShardedMessageDistribution::new(1, model, config(50));
    let result = distribution.send(&Destination::queue("orders"), message(1, "orders")).await;
    assert!(matches!(result, Err(GantryError::NotStarted(_))));
}

/// **Test:** Async correlation cleanup on stop.
///
/// **Reason:** Callers waiting on broker responses must never be left hanging when a
/// distribution shuts down.
///
/// **Expectation:** Each of the N pending requests is answered exactly once with a
/// "stopped" exception carrying the client's command id, and the map ends empty.
#[tokio::test]
async fn stop_fails_every_pending_request() {
    let model = model();
    let (broker, _) = add_silent_broker(&model, "broker-1").await;
    let distribution = Arc::new(ShardedMessageDistribution::new(1, model.clone(), config(1_000)));
    broker.view().create_transport(distribution.clone()).await.unwrap();

    let mut receivers = Vec::new();
    for id in 0..5u32 {
        let command = message(100 + id, "orders").with_response_required();
        receivers.push(
            distribution
                .async_send(&Destination::queue("orders"), command)
                .await
                .unwrap(),
        );
    }
    assert_eq!(distribution.pending_requests().await, 5);

    distribution.stop().await;
    assert_eq!(distribution.pending_requests().await, 0);
    assert_eq!(distribution.readiness(), Readiness::Stopped);

    for (id, receiver) in receivers.into_iter().enumerate() {
        let response = receiver.await.unwrap();
        match response.kind {
            CommandKind::ExceptionResponse { correlation_id, message } => {
                assert_eq!(correlation_id, 100 + id as u32);
                assert!(message.contains("stopped"));
            }
            other => panic!("expected exception response, got {:?}", other),
        }
    }

    // stopping twice is harmless and new sends are refused
    distribution.stop().await;
    assert!(matches!(
        distribution.send(&Destination::queue("orders"), message(9, "orders")).await,
        Err(GantryError::Stopped)
    ));
}

#[tokio::test]
async fn broker_response_completes_matching_request() {
    let model = model();
    let (broker, sent) = add_silent_broker(&model, "broker-1").await;
    let distribution = Arc::new(ShardedMessageDistribution::new(1, model.clone(), config(1_000)));
    broker.view().create_transport(distribution.clone()).await.unwrap();

    let receiver = distribution
        .async_send(&Destination::queue("orders"), message(42, "orders").with_response_required())
        .await
        .unwrap();
    let request_id = sent.lock().await[0].command_id;

    distribution
        .on_broker_command("broker-1", Command::response(request_id))
        .await;
    let response = receiver.await.unwrap();
    assert_eq!(response.correlation_id(), Some(42));
    assert!(!response.is_exception());
    assert_eq!(distribution.pending_requests().await, 0);
}

/// **Test:** State replay onto a broker attached after the client set up its session.
///
/// **Expectation:** The new broker sees the connection, then the session, then its
/// consumer and producer, in that order.
#[tokio::test]
async fn late_broker_gets_client_state_replayed_in_order() {
    let model = model();
    let (first, _) = add_silent_broker(&model, "broker-1").await;
    let distribution = Arc::new(ShardedMessageDistribution::new(1, model.clone(), config(1_000)));
    first.view().create_transport(distribution.clone()).await.unwrap();

    let connection = ConnectionId::new("c1");
    let session = connection.session(1);
    let queue = Destination::queue("orders");
    let client_commands = vec![
        CommandKind::ConnectionInfo(ConnectionInfo {
            connection_id: connection.clone(),
            client_id: Some("client".into()),
            user_name: None,
        }),
        CommandKind::SessionInfo(SessionInfo { session_id: session.clone() }),
        CommandKind::ProducerInfo(ProducerInfo {
            producer_id: session.producer(1),
            destination: Some(queue.clone()),
        }),
        CommandKind::ConsumerInfo(ConsumerInfo {
            consumer_id: session.consumer(1),
            destination: queue.clone(),
            selector: None,
            prefetch_size: 1000,
        }),
    ];
    for (id, kind) in client_commands.into_iter().enumerate() {
        distribution.on_client_command(Command::new(id as u32 + 1, kind)).await.unwrap();
    }

    let (second, replayed) = add_silent_broker(&model, "broker-2").await;
    second.view().create_transport(distribution.clone()).await.unwrap();

    let names: Vec<_> = replayed.lock().await.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["ConnectionInfo", "SessionInfo", "ConsumerInfo", "ProducerInfo"]);
    assert_eq!(distribution.attached_brokers().await, vec!["broker-1", "broker-2"]);
}

#[tokio::test]
async fn broadcast_reaches_every_attached_broker() {
    let model = model();
    let (a, sent_a) = add_silent_broker(&model, "broker-a").await;
    let (b, sent_b) = add_silent_broker(&model, "broker-b").await;
    let distribution = Arc::new(ShardedMessageDistribution::new(1, model.clone(), config(1_000)));
    a.view().create_transport(distribution.clone()).await.unwrap();
    b.view().create_transport(distribution.clone()).await.unwrap();

    let receiver = distribution
        .async_send_all(
            Command::new(
                7,
                CommandKind::SessionInfo(SessionInfo {
                    session_id: ConnectionId::new("c1").session(1),
                }),
            ),
            false,
        )
        .await
        .unwrap();

    let to_a = sent_a.lock().await[0].command_id;
    let to_b = sent_b.lock().await[0].command_id;
    assert_eq!(to_a, to_b);

    distribution.on_broker_command("broker-a", Command::response(to_a)).await;
    assert_eq!(distribution.pending_requests().await, 1);
    distribution
        .on_broker_command("broker-b", Command::exception(to_b, "session refused"))
        .await;

    let response = receiver.await.unwrap();
    assert_eq!(response.correlation_id(), Some(7));
    assert!(response.is_exception());
}

/// **Test:** Broker URI change followed by a failed reconnect.
///
/// **Reason:** Dropping a transport for a new URI detaches the broker. If the
/// distribution still counted it as attached, sends would fail fast instead of waiting
/// for a broker to come back.
///
/// **Expectation:** With the reconnect refused the distribution is unattached and a
/// send times out with `NotStarted`; once connects succeed the next reconnect targets
/// the new URI and re-attaches.
#[tokio::test]
async fn uri_change_with_refused_reconnect_blocks_sends() {
    let model = model();
    let (broker, connector) = add_flaky_broker(&model, "broker-1").await;
    let distribution = Arc::new(ShardedMessageDistribution::new(1, model.clone(), config(100)));
    broker.view().create_transport(distribution.clone()).await.unwrap();
    assert_eq!(distribution.readiness(), Readiness::Attached);

    connector.refusing.store(true, Ordering::SeqCst);
    broker
        .view()
        .update("broker-1", "tcp://moved:61616", BrokerOverview::new("broker-1", "broker-1"))
        .await;
    assert_eq!(distribution.readiness(), Readiness::Unattached);
    assert_eq!(broker.view().update_transport().await, 0);
    assert_eq!(distribution.readiness(), Readiness::Unattached);
    assert!(distribution.attached_brokers().await.is_empty());

    let result = distribution.send(&Destination::queue("orders"), message(1, "orders")).await;
    assert!(matches!(result, Err(GantryError::NotStarted(_))));

    connector.refusing.store(false, Ordering::SeqCst);
    assert_eq!(broker.view().update_transport().await, 1);
    assert_eq!(distribution.readiness(), Readiness::Attached);
    let transport = broker.view().transport_for(1).await.unwrap();
    assert_eq!(transport.remote_address(), "tcp://moved:61616");
}

/// **Test:** One distribution reconnecting while another keeps sending.
///
/// **Reason:** A reconnect includes the connect and the client state replay, both of
/// which can take a long time. Healthy transports of the same broker must stay usable
/// meanwhile.
///
/// **Expectation:** While a slow reconnect of the stale distribution is in flight, that
/// distribution is unattached and the healthy one sends without waiting for it.
#[tokio::test]
async fn slow_reconnect_does_not_hold_up_other_distributions() {
    let model = model();
    let (broker, connector) = add_flaky_broker(&model, "broker-1").await;
    let stale = Arc::new(ShardedMessageDistribution::new(1, model.clone(), config(1_000)));
    let healthy = Arc::new(ShardedMessageDistribution::new(2, model.clone(), config(1_000)));
    broker.view().create_transport(stale.clone()).await.unwrap();
    broker.view().create_transport(healthy.clone()).await.unwrap();

    broker.view().transport_for(1).await.unwrap().stop().await;
    connector.delay_ms.store(1_000, Ordering::SeqCst);

    let reconnect = {
        let view = broker.view().clone();
        tokio::spawn(async move { view.update_transport().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reconnect.is_finished());
    assert_eq!(stale.readiness(), Readiness::Unattached);

    let started = Instant::now();
    healthy
        .send(&Destination::queue("orders"), message(1, "orders"))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));

    assert_eq!(reconnect.await.unwrap(), 1);
    assert_eq!(stale.readiness(), Readiness::Attached);
    assert_eq!(broker.view().read().await.live_transport_count(), 2);
}

/// **Test:** Self-healing of a transport the broker side reported as failed.
///
/// **Expectation:** The failure detaches the broker but keeps the registration; the
/// next `update_transport` rebuilds exactly one transport and replays the connection,
/// the session, the consumer and the producer in that order.
#[tokio::test]
async fn lost_transport_is_rebuilt_with_client_state_replayed() {
    let model = model();
    let (broker, connector) = add_flaky_broker(&model, "broker-1").await;
    let distribution = Arc::new(ShardedMessageDistribution::new(1, model.clone(), config(1_000)));
    broker.view().create_transport(distribution.clone()).await.unwrap();

    let connection = ConnectionId::new("c1");
    let session = connection.session(1);
    let queue = Destination::queue("orders");
    let client_commands = vec![
        CommandKind::ConnectionInfo(ConnectionInfo {
            connection_id: connection.clone(),
            client_id: Some("client".into()),
            user_name: None,
        }),
        CommandKind::SessionInfo(SessionInfo { session_id: session.clone() }),
        CommandKind::ProducerInfo(ProducerInfo {
            producer_id: session.producer(1),
            destination: Some(queue.clone()),
        }),
        CommandKind::ConsumerInfo(ConsumerInfo {
            consumer_id: session.consumer(1),
            destination: queue.clone(),
            selector: None,
            prefetch_size: 1000,
        }),
    ];
    for (id, kind) in client_commands.into_iter().enumerate() {
        distribution.on_client_command(Command::new(id as u32 + 1, kind)).await.unwrap();
    }
    connector.inner.sent.lock().await.clear();

    broker.view().transport_for(1).await.unwrap().stop().await;
    let listener = connector.listeners.lock().await[0].clone();
    listener
        .on_exception(GantryError::Transport("connection reset".into()))
        .await;
    assert_eq!(distribution.readiness(), Readiness::Unattached);
    assert!(broker.view().transport_for(1).await.is_none());
    assert_eq!(broker.view().read().await.registered_distributions(), 1);

    assert_eq!(broker.view().update_transport().await, 1);
    assert_eq!(distribution.readiness(), Readiness::Attached);
    assert_eq!(distribution.attached_brokers().await, vec!["broker-1"]);
    let names: Vec<_> = connector.inner.sent.lock().await.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["ConnectionInfo", "SessionInfo", "ConsumerInfo", "ProducerInfo"]);

    // a second pass finds nothing to rebuild
    assert_eq!(broker.view().update_transport().await, 0);
}
