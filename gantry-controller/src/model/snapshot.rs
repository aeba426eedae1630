use gantry_core::{BrokerOverview, Destination};
use std::cmp::Ordering;
use std::sync::Arc;

use super::policy::LoadPolicy;

#[derive(Debug, Clone)]
pub struct BrokerSnapshot {
    pub broker_id: String,
    pub overview: BrokerOverview,
    pub load: u32,
}

/// Orders brokers from least to most loaded: load score first, then the overview
/// ordering (depth, producers, consumers, queues, id) reversed.
fn cmp_ascending_load(a: &BrokerSnapshot, b: &BrokerSnapshot) -> Ordering {
    a.load
        .cmp(&b.load)
        .then_with(|| b.overview.cmp_load(&a.overview))
}

/// Read-only copy of the fleet that scaling rules evaluate against.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    brokers: Vec<BrokerSnapshot>,
    policy: Arc<LoadPolicy>,
}

impl ModelSnapshot {
    pub fn new(policy: Arc<LoadPolicy>, overviews: Vec<BrokerOverview>) -> Self {
        let brokers = overviews
            .into_iter()
            .map(|overview| BrokerSnapshot {
                broker_id: overview.broker_id.clone(),
                load: policy.load(&overview),
                overview,
            })
            .collect();
        ModelSnapshot { brokers, policy }
    }

    pub fn policy(&self) -> &LoadPolicy {
        &self.policy
    }

    pub fn brokers(&self) -> &[BrokerSnapshot] {
        &self.brokers
    }

    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }

    pub fn get(&self, broker_id: &str) -> Option<&BrokerSnapshot> {
        self.brokers.iter().find(|b| b.broker_id == broker_id)
    }

    /// Mean load score, 0 for an empty fleet.
    pub fn average_load(&self) -> f64 {
        if self.brokers.is_empty() {
            return 0.0;
        }
        let total: u64 = self.brokers.iter().map(|b| b.load as u64).sum();
        total as f64 / self.brokers.len() as f64
    }

    pub fn least_loaded(&self) -> Option<&BrokerSnapshot> {
        self.brokers.iter().min_by(|a, b| cmp_ascending_load(a, b))
    }

    pub fn most_loaded(&self) -> Option<&BrokerSnapshot> {
        self.brokers.iter().max_by(|a, b| cmp_ascending_load(a, b))
    }

    /// Least loaded broker other than `excluded`.
    pub fn next_least_loaded(&self, excluded: &str) -> Option<&BrokerSnapshot> {
        self.brokers
            .iter()
            .filter(|b| b.broker_id != excluded)
            .min_by(|a, b| cmp_ascending_load(a, b))
    }

    pub fn broker_limits_exceeded(&self, broker: &BrokerSnapshot) -> bool {
        self.policy.broker_limits_exceeded(&broker.overview)
    }

    pub fn destination_limits_exceeded(&self, broker: &BrokerSnapshot) -> bool {
        self.policy.destination_limits_exceeded(&broker.overview)
    }

    pub fn limits_exceeded(&self, broker: &BrokerSnapshot) -> bool {
        self.policy.limits_exceeded(&broker.overview)
    }

    /// Half the gap in active destinations between `most` and `least`, rounded down.
    pub fn movable_destination_count(&self, most: &BrokerSnapshot, least: &BrokerSnapshot) -> usize {
        let most_active = most.overview.total_active_destinations();
        let least_active = least.overview.total_active_destinations();
        most_active.saturating_sub(least_active) / 2
    }

    /// The `n` hottest client destinations of a broker.
    pub fn hottest_destinations(&self, broker: &BrokerSnapshot, n: usize) -> Vec<Destination> {
        broker
            .overview
            .sorted_destinations()
            .into_iter()
            .filter(|d| !d.destination.is_internal())
            .take(n)
            .map(|d| d.destination.clone())
            .collect()
    }
}
