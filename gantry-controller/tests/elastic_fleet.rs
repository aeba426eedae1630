//! End-to-end runs of the controller against an in-process broker fleet.

use futures::{SinkExt, StreamExt};
use gantry_controller::control::local::LocalControl;
use gantry_controller::distribution::{DistributionRegistry, ShardedMessageDistribution};
use gantry_controller::local::LocalFleet;
use gantry_controller::service_configuration::{LoadConfiguration, ServiceConfiguration};
use gantry_controller::GantryController;
use gantry_core::command::{Command, CommandKind, ConnectionId, ConnectionInfo, Message, WireFormatInfo};
use gantry_core::wire::FrameCodec;
use gantry_core::Destination;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::codec::Framed;

const CONFIG: &str = r#"
controller:
  id: gantry-e2e
  host: 127.0.0.1
  ports:
    client: 0
  poll_interval_ms: 60000
limits:
  max_destination_depth: 10
scaling:
  scale_down_threshold_percent: 0
  max_brokers: 2
migration:
  receive_timeout_ms: 20
control:
  mode: local
  initial_brokers: 1
"#;

fn service_config() -> ServiceConfiguration {
    let load: LoadConfiguration = serde_yaml::from_str(CONFIG).unwrap();
    load.try_into().unwrap()
}

async fn controller(fleet: &LocalFleet) -> GantryController {
    GantryController::new(
        service_config(),
        Arc::new(LocalControl::new(fleet.clone())),
        Arc::new(fleet.clone()),
        None,
    )
    .await
    .unwrap()
}

async fn publish(fleet: &LocalFleet, broker_id: &str, queue: &str, count: usize) {
    for i in 0..count {
        let message = Message::new(format!("{}-{}", queue, i), Destination::queue(queue), vec![0]);
        fleet.enqueue(broker_id, message).await.unwrap();
    }
}

#[tokio::test]
/// What this test validates
///
/// - Scenario: one broker hosts a queue deeper than the per-destination limit. The first
///   poll scales the fleet up to the two-broker ceiling; the next poll sees the new,
///   idle broker and rebalances.
/// - Expectations:
///   - the platform is asked for exactly one more broker
///   - the hottest queue migrates with all of its messages and the new broker owns it
///   - the cooler queues stay where they are
///   - a client distribution routes the migrated queue through its transport to the new broker
async fn overloaded_broker_scales_out_and_rebalances() {
    let fleet = LocalFleet::with_brokers(1).await;
    publish(&fleet, "broker-1", "hot", 20).await;
    publish(&fleet, "broker-1", "warm", 5).await;
    publish(&fleet, "broker-1", "cool", 3).await;

    let controller = controller(&fleet).await;
    let control = controller.control().clone();
    let registry: Arc<dyn DistributionRegistry> = control.clone();
    let distribution = Arc::new(
        ShardedMessageDistribution::new(7, control.model().clone(), Default::default())
            .with_registry(Arc::downgrade(&registry)),
    );
    control.register_distribution(distribution.clone()).await;

    control.poll_cycle().await.unwrap();
    assert_eq!(fleet.desired_replicas().await, 2);
    assert_eq!(fleet.broker_ids().await, vec!["broker-1", "broker-2"]);

    control.poll_cycle().await.unwrap();
    assert_eq!(control.model().broker_count().await, 2);

    let hot = Destination::queue("hot");
    let deadline = Instant::now() + Duration::from_secs(5);
    while control.model().owner_of(&hot).await.as_deref() != Some("broker-2") {
        assert!(Instant::now() < deadline, "hot queue never migrated");
        sleep(Duration::from_millis(20)).await;
    }
    while control.is_rebalancing() {
        assert!(Instant::now() < deadline, "rebalance never finished");
        sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(fleet.queue_depth("broker-2", &hot).await, Some(20));
    assert_eq!(
        control.model().owner_of(&Destination::queue("warm")).await.as_deref(),
        Some("broker-1")
    );
    assert_eq!(fleet.desired_replicas().await, 2);

    let routed = control.model().get_transport(7, &hot).await.unwrap();
    let broker_2 = control.model().get_broker_by_id("broker-2").await.unwrap();
    let expected = broker_2.view().transport_for(7).await.unwrap();
    assert!(Arc::ptr_eq(&routed, &expected));

    controller.stop().await;
}

#[tokio::test]
/// What this test validates
///
/// - Scenario: a client connects to the started controller over TCP, announces its
///   connection and sends a persistent message.
/// - Expectations: both are acknowledged and the message is stored on the only broker.
async fn client_traffic_through_a_started_controller() {
    let fleet = LocalFleet::with_brokers(1).await;
    let controller = controller(&fleet).await;
    controller.start().await.unwrap();

    let socket = TcpStream::connect(controller.local_addr()).await.unwrap();
    let mut framed = Framed::new(socket, FrameCodec::default());
    framed
        .send(Command::new(0, CommandKind::WireFormatInfo(WireFormatInfo::default())))
        .await
        .unwrap();
    let hello = framed.next().await.unwrap().unwrap();
    assert!(matches!(hello.kind, CommandKind::WireFormatInfo(_)));

    let connection = Command::new(
        1,
        CommandKind::ConnectionInfo(ConnectionInfo {
            connection_id: ConnectionId::new("e2e"),
            client_id: None,
            user_name: None,
        }),
    )
    .with_response_required();
    framed.send(connection).await.unwrap();
    let reply = timeout(Duration::from_secs(2), framed.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply.correlation_id(), Some(1));
    assert!(!reply.is_exception());

    let queue = Destination::queue("orders");
    let message = Command::new(2, CommandKind::Message(Message::new("m-1", queue.clone(), b"hi".to_vec())))
        .with_response_required();
    framed.send(message).await.unwrap();
    let reply = timeout(Duration::from_secs(2), framed.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply.correlation_id(), Some(2));
    assert!(!reply.is_exception());

    assert_eq!(fleet.queue_depth("broker-1", &queue).await, Some(1));
    assert_eq!(controller.control().model().owner_of(&queue).await.as_deref(), Some("broker-1"));

    controller.stop().await;
}
