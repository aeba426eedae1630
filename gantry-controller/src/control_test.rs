use gantry_core::command::Message;
use gantry_core::metadata::MemoryStore;
use gantry_core::Destination;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::local::LocalControl;
use super::*;
use crate::coordination::CoordinationConfig;
use crate::distribution::{Readiness, ShardedMessageDistribution};
use crate::local::LocalFleet;
use crate::migration::MigrationConfig;
use crate::model::{BrokerLimits, LoadPolicy, LoadWeights};

/// Scaling settings under which an idle fleet fires no rule.
fn quiet_scaling() -> ScalingConfig {
    ScalingConfig {
        scale_down_threshold_percent: 0,
        max_brokers: 4,
        ..Default::default()
    }
}

async fn local_control(
    brokers: usize,
    scaling: ScalingConfig,
    policy: LoadPolicy,
    coordinator: Option<Arc<ClusterCoordinator>>,
) -> (LocalFleet, Arc<BrokerControl>) {
    let fleet = LocalFleet::with_brokers(brokers).await;
    let executor = Arc::new(TaskExecutor::new("control-test", 8));
    let model = Arc::new(Model::new(
        policy,
        MigrationConfig {
            receive_timeout_ms: 20,
            copy_timeout_seconds: 5,
        },
        Arc::new(fleet.clone()),
        executor.clone(),
    ));
    let control = BrokerControl::new(
        BrokerControlConfig::default(),
        scaling,
        Arc::new(LocalControl::new(fleet.clone())),
        model,
        executor,
        coordinator,
    )
    .await;
    (fleet, control)
}

/// Reconciles the model without running the scaling rules.
async fn sync(control: &BrokerControl) {
    let poll = control.provider.poll_brokers().await.unwrap();
    control.reconcile(poll).await;
}

async fn publish(fleet: &LocalFleet, broker_id: &str, queue: &str, count: usize) {
    for i in 0..count {
        let message = Message::new(format!("{}-{}", queue, i), Destination::queue(queue), vec![0]);
        fleet.enqueue(broker_id, message).await.unwrap();
    }
}

fn distribution(id: u64, control: &Arc<BrokerControl>) -> Arc<ShardedMessageDistribution> {
    let registry: Arc<dyn DistributionRegistry> = control.clone();
    Arc::new(
        ShardedMessageDistribution::new(id, control.model().clone(), Default::default())
            .with_registry(Arc::downgrade(&registry)),
    )
}

#[derive(Default)]
struct SizeRecorder {
    sizes: Mutex<Vec<usize>>,
}

#[async_trait]
impl BrokerModelChangedListener for SizeRecorder {
    async fn brokers_changed(&self, brokers: &[BrokerStatus]) {
        self.sizes.lock().await.push(brokers.len());
    }
}

/// **Test:** Discovery of running brokers.
///
/// **Reason:** A distribution registered before any broker exists must be attached to
/// every broker the first poll finds.
///
/// **Expectation:** Both brokers enter the model and the distribution is attached to
/// both.
#[tokio::test]
async fn poll_cycle_adds_brokers_and_attaches_distributions() {
    let (_fleet, control) = local_control(2, quiet_scaling(), LoadPolicy::default(), None).await;
    let distribution = distribution(1, &control);
    control.register_distribution(distribution.clone()).await;
    assert_eq!(distribution.readiness(), Readiness::Unattached);

    control.poll_cycle().await.unwrap();
    assert_eq!(control.model().broker_count().await, 2);
    assert_eq!(distribution.attached_brokers().await, vec!["broker-1", "broker-2"]);
    assert_eq!(distribution.readiness(), Readiness::Attached);

    // stopping the distribution deregisters it and releases its transports
    distribution.stop().await;
    assert_eq!(control.distribution_count().await, 0);
    let broker = control.model().get_broker_by_id("broker-1").await.unwrap();
    assert!(broker.view().transport_for(1).await.is_none());
}

/// **Test:** Scale guard idempotence.
///
/// **Expectation:** Two scale-up requests in a row raise the replica count once; the
/// guard clears after a poll observes the new broker.
#[tokio::test]
async fn repeated_scale_up_requests_one_broker() {
    let (fleet, control) = local_control(1, quiet_scaling(), LoadPolicy::default(), None).await;
    control.poll_cycle().await.unwrap();

    assert!(control.scale_up().await.unwrap());
    assert!(!control.scale_up().await.unwrap());
    assert_eq!(fleet.desired_replicas().await, 2);
    assert_eq!(fleet.broker_count().await, 2);
    assert!(control.guard().is_working().await);

    control.poll_cycle().await.unwrap();
    assert_eq!(control.model().broker_count().await, 2);
    assert!(!control.guard().is_working().await);
}

#[tokio::test]
async fn scale_up_stops_at_max_brokers() {
    let scaling = ScalingConfig {
        max_brokers: 1,
        ..quiet_scaling()
    };
    let (fleet, control) = local_control(1, scaling, LoadPolicy::default(), None).await;
    control.poll_cycle().await.unwrap();
    assert!(!control.scale_up().await.unwrap());
    assert_eq!(fleet.broker_count().await, 1);
}

#[tokio::test]
async fn vanished_broker_is_evicted() {
    let (fleet, control) = local_control(2, quiet_scaling(), LoadPolicy::default(), None).await;
    publish(&fleet, "broker-1", "orders", 1).await;
    control.poll_cycle().await.unwrap();
    assert_eq!(control.model().owner_of(&Destination::queue("orders")).await.as_deref(), Some("broker-1"));

    fleet.stop_broker("broker-1").await;
    control.poll_cycle().await.unwrap();
    assert_eq!(control.model().broker_count().await, 1);
    assert_eq!(control.model().owner_of(&Destination::queue("orders")).await, None);
}

/// **Test:** Transports cut under a running broker.
///
/// **Reason:** A broker that stays up keeps its place in the model; the poll loop is
/// what heals the client's connection to it.
///
/// **Expectation:** The cut leaves the distribution unattached with its registration
/// kept; the next poll reconnects it and the broker sees one connection again.
#[tokio::test]
async fn poll_rebuilds_transports_cut_under_a_running_broker() {
    let (fleet, control) = local_control(1, quiet_scaling(), LoadPolicy::default(), None).await;
    let distribution = distribution(1, &control);
    control.register_distribution(distribution.clone()).await;
    control.poll_cycle().await.unwrap();
    assert_eq!(distribution.readiness(), Readiness::Attached);

    assert_eq!(fleet.drop_transports("broker-1").await, 1);
    // the listener is told from a spawned task
    for _ in 0..100 {
        if distribution.readiness() == Readiness::Unattached {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(distribution.readiness(), Readiness::Unattached);
    let broker = control.model().get_broker_by_id("broker-1").await.unwrap();
    assert!(broker.view().transport_for(1).await.is_none());
    assert_eq!(broker.view().read().await.registered_distributions(), 1);

    control.poll_cycle().await.unwrap();
    assert_eq!(distribution.readiness(), Readiness::Attached);
    assert!(broker.view().transport_for(1).await.is_some());
    assert_eq!(fleet.overview("broker-1").await.unwrap().total_connections, 1);
}

/// **Test:** Scale down drains before destroying.
///
/// **Expectation:** The least loaded broker's queue ends up on the survivor, which now
/// owns it; the drained broker is gone from the model and the fleet, and the client
/// distribution stays attached to the survivor.
#[tokio::test]
async fn scale_down_drains_least_loaded_broker() {
    let (fleet, control) = local_control(2, quiet_scaling(), LoadPolicy::default(), None).await;
    publish(&fleet, "broker-1", "orders", 5).await;
    publish(&fleet, "broker-2", "payments", 2).await;
    let distribution = distribution(1, &control);
    control.register_distribution(distribution.clone()).await;
    sync(&control).await;

    assert!(control.scale_down().await.unwrap());

    let payments = Destination::queue("payments");
    assert_eq!(fleet.broker_ids().await, vec!["broker-1"]);
    assert_eq!(fleet.queue_depth("broker-1", &payments).await, Some(2));
    assert_eq!(fleet.desired_replicas().await, 1);
    assert_eq!(control.model().owner_of(&payments).await.as_deref(), Some("broker-1"));
    assert_eq!(control.model().broker_count().await, 1);
    assert_eq!(distribution.attached_brokers().await, vec!["broker-1"]);
    assert_eq!(distribution.readiness(), Readiness::Attached);
}

#[tokio::test]
async fn failed_drain_keeps_the_broker() {
    let (fleet, control) = local_control(2, quiet_scaling(), LoadPolicy::default(), None).await;
    publish(&fleet, "broker-1", "orders", 5).await;
    publish(&fleet, "broker-2", "payments", 2).await;
    sync(&control).await;
    fleet.fail_sends_to("broker-1", true).await;

    assert!(matches!(control.scale_down().await, Err(GantryError::MigrationFailed(_))));
    assert_eq!(fleet.broker_count().await, 2);
    assert_eq!(control.model().broker_count().await, 2);
    assert_eq!(
        control.model().owner_of(&Destination::queue("payments")).await.as_deref(),
        Some("broker-2")
    );
    assert!(!control.guard().is_working().await);
}

/// **Test:** Load distribution between an overloaded and an idle broker.
///
/// **Expectation:** Half the active-destination gap (one destination) moves, and it is
/// the hottest one.
#[tokio::test]
async fn distribute_load_moves_the_hottest_destination() {
    let policy = LoadPolicy::new(
        BrokerLimits {
            max_destination_depth: 10,
            ..Default::default()
        },
        LoadWeights::default(),
    );
    let (fleet, control) = local_control(2, quiet_scaling(), policy, None).await;
    publish(&fleet, "broker-1", "hot", 20).await;
    publish(&fleet, "broker-1", "warm", 5).await;
    publish(&fleet, "broker-1", "cool", 3).await;
    sync(&control).await;

    assert!(control.distribute_load().await.unwrap());
    let hot = Destination::queue("hot");
    assert_eq!(control.model().owner_of(&hot).await.as_deref(), Some("broker-2"));
    assert_eq!(fleet.queue_depth("broker-2", &hot).await, Some(20));
    assert_eq!(
        control.model().owner_of(&Destination::queue("warm")).await.as_deref(),
        Some("broker-1")
    );
}

#[tokio::test]
async fn model_listeners_see_fleet_size_changes() {
    let (fleet, control) = local_control(2, quiet_scaling(), LoadPolicy::default(), None).await;
    let recorder = Arc::new(SizeRecorder::default());
    control.add_model_listener(recorder.clone()).await;

    control.poll_cycle().await.unwrap();
    control.poll_cycle().await.unwrap();
    fleet.stop_broker("broker-2").await;
    control.poll_cycle().await.unwrap();

    assert_eq!(*recorder.sizes.lock().await, vec![2, 1]);
}

/// **Test:** Scaling lock held by another controller.
///
/// **Expectation:** The scale-up is abandoned with a lock timeout, the replica count
/// is untouched and the guard is free for the next cycle.
#[tokio::test]
async fn scale_up_is_abandoned_when_the_scaling_lock_is_held() {
    let store: Arc<dyn gantry_core::metadata::MetadataStore> = Arc::new(MemoryStore::new());
    let config = CoordinationConfig {
        enabled: true,
        lock_timeout_ms: 100,
        ..Default::default()
    };
    let other = ClusterCoordinator::new(store.clone(), "controller-b", config.clone());
    assert!(other.acquire_lock(&config.scaling_lock, Duration::ZERO).await.unwrap());

    let ours = Arc::new(ClusterCoordinator::new(store, "controller-a", config));
    let (fleet, control) = local_control(1, quiet_scaling(), LoadPolicy::default(), Some(ours)).await;
    control.poll_cycle().await.unwrap();

    assert!(matches!(control.scale_up().await, Err(GantryError::LockTimeout(_))));
    assert_eq!(fleet.desired_replicas().await, 1);
    assert!(!control.guard().is_working().await);

    other.release_lock("scaling").await.unwrap();
    assert!(control.scale_up().await.unwrap());
    assert_eq!(fleet.desired_replicas().await, 2);
}
