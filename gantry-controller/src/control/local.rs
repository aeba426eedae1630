use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{BrokerPoll, BrokerProvider};
use crate::controller_metrics::BROKER_POLL_FAILURES_TOTAL;
use crate::errors::Result;
use crate::local::LocalFleet;
use crate::management::collect_broker_status;
use crate::transport::Connector;

/// Runs the control loop against an in-process `LocalFleet`.
pub struct LocalControl {
    fleet: LocalFleet,
}

impl LocalControl {
    pub fn new(fleet: LocalFleet) -> Self {
        LocalControl { fleet }
    }

    pub fn fleet(&self) -> &LocalFleet {
        &self.fleet
    }
}

#[async_trait]
impl BrokerProvider for LocalControl {
    async fn poll_brokers(&self) -> Result<BrokerPoll> {
        let mut poll = BrokerPoll::default();
        for broker_id in self.fleet.broker_ids().await {
            match collect_broker_status(&self.fleet, &broker_id).await {
                Ok(status) => poll.statuses.push(status),
                Err(e) => {
                    metrics::counter!(BROKER_POLL_FAILURES_TOTAL.name).increment(1);
                    warn!(broker_id = %broker_id, error = %e, "broker statistics unavailable, skipped this cycle");
                    poll.unreachable.push(broker_id);
                }
            }
        }
        Ok(poll)
    }

    async fn desired_replicas(&self) -> Result<usize> {
        Ok(self.fleet.desired_replicas().await)
    }

    async fn set_desired_replicas(&self, replicas: usize) -> Result<()> {
        self.fleet.set_replicas(replicas).await;
        Ok(())
    }

    async fn delete_broker(&self, broker_id: &str) -> Result<()> {
        if !self.fleet.stop_broker(broker_id).await {
            debug!(broker_id = %broker_id, "broker already gone");
        }
        Ok(())
    }

    fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.fleet.clone())
    }
}
