use gantry_core::{BrokerOverview, Destination};
use std::fmt;
use std::sync::Arc;

use super::broker_view::BrokerView;
use super::policy::LoadPolicy;
use crate::distribution::MessageDistribution;

/// A broker as the fleet model sees it: its view plus the load policy shared with
/// the model. Identity is the broker id.
pub struct BrokerModel {
    view: Arc<BrokerView>,
    policy: Arc<LoadPolicy>,
}

impl BrokerModel {
    pub fn new(view: Arc<BrokerView>, policy: Arc<LoadPolicy>) -> Self {
        BrokerModel { view, policy }
    }

    pub fn broker_id(&self) -> &str {
        self.view.broker_id()
    }

    pub fn view(&self) -> &Arc<BrokerView> {
        &self.view
    }

    pub async fn overview(&self) -> BrokerOverview {
        self.view.overview().await
    }

    pub async fn load(&self) -> u32 {
        self.policy.load(&self.view.read().await.overview)
    }

    pub async fn are_broker_limits_exceeded(&self) -> bool {
        self.policy.broker_limits_exceeded(&self.view.read().await.overview)
    }

    pub async fn are_destination_limits_exceeded(&self) -> bool {
        self.policy.destination_limits_exceeded(&self.view.read().await.overview)
    }

    /// The `n` most loaded destinations this broker reports.
    pub async fn sorted_destinations(&self, n: usize) -> Vec<Destination> {
        self.view
            .read()
            .await
            .overview
            .sorted_destinations()
            .into_iter()
            .take(n)
            .map(|d| d.destination.clone())
            .collect()
    }

    pub async fn start(&self, distributions: Vec<Arc<dyn MessageDistribution>>) -> usize {
        self.view.attach_transports(distributions).await
    }

    pub async fn stop(&self) {
        self.view.stop().await
    }
}

impl PartialEq for BrokerModel {
    fn eq(&self, other: &Self) -> bool {
        self.broker_id() == other.broker_id()
    }
}

impl Eq for BrokerModel {}

impl fmt::Debug for BrokerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerModel")
            .field("broker_id", &self.broker_id())
            .finish()
    }
}
