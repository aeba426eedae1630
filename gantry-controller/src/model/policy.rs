use gantry_core::BrokerOverview;
use serde::{Deserialize, Serialize};

/// Per-broker and per-destination ceilings. A value above a ceiling counts as exceeded,
/// a value equal to it does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerLimits {
    pub max_connections_per_broker: u64,
    pub max_destinations_per_broker: u64,
    pub max_destination_depth: i64,
    pub max_producers_per_destination: u64,
    pub max_consumers_per_destination: u64,
}

impl Default for BrokerLimits {
    fn default() -> Self {
        BrokerLimits {
            max_connections_per_broker: 1000,
            max_destinations_per_broker: 500,
            max_destination_depth: 10_000,
            max_producers_per_destination: 100,
            max_consumers_per_destination: 100,
        }
    }
}

/// Relative weight of each input to the load score, in percent. The two weights sum to 100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadWeights {
    pub connections: u32,
    pub destinations: u32,
}

impl Default for LoadWeights {
    fn default() -> Self {
        LoadWeights {
            connections: 80,
            destinations: 20,
        }
    }
}

/// Load scoring and limit checks shared by the model, its brokers and the scaling rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadPolicy {
    pub limits: BrokerLimits,
    pub weights: LoadWeights,
}

impl LoadPolicy {
    pub fn new(limits: BrokerLimits, weights: LoadWeights) -> Self {
        LoadPolicy { limits, weights }
    }

    /// Weighted load as an integer percentage. Monotonic in both the connection count
    /// and the destination count; usage above a ceiling is not capped, so the score can
    /// exceed 100.
    pub fn load(&self, overview: &BrokerOverview) -> u32 {
        let connections = percent_of(overview.total_connections, self.limits.max_connections_per_broker);
        let destinations = percent_of(
            overview.total_destinations() as u64,
            self.limits.max_destinations_per_broker,
        );
        let weighted = self.weights.connections as u64 * connections
            + self.weights.destinations as u64 * destinations;
        u32::try_from(weighted / 100).unwrap_or(u32::MAX)
    }

    pub fn broker_limits_exceeded(&self, overview: &BrokerOverview) -> bool {
        overview.total_connections > self.limits.max_connections_per_broker
            || overview.total_destinations() as u64 > self.limits.max_destinations_per_broker
    }

    pub fn destination_limits_exceeded(&self, overview: &BrokerOverview) -> bool {
        overview.destinations().any(|d| {
            d.queue_depth > self.limits.max_destination_depth
                || d.number_of_producers > self.limits.max_producers_per_destination
                || d.number_of_consumers > self.limits.max_consumers_per_destination
        })
    }

    pub fn limits_exceeded(&self, overview: &BrokerOverview) -> bool {
        self.broker_limits_exceeded(overview) || self.destination_limits_exceeded(overview)
    }
}

fn percent_of(value: u64, max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    value.saturating_mul(100) / max
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{Destination, DestinationOverview};

    fn policy() -> LoadPolicy {
        LoadPolicy::new(
            BrokerLimits {
                max_connections_per_broker: 20,
                max_destinations_per_broker: 10,
                max_destination_depth: 100,
                max_producers_per_destination: 5,
                max_consumers_per_destination: 5,
            },
            LoadWeights::default(),
        )
    }

    fn with_destinations(connections: u64, destinations: usize) -> BrokerOverview {
        let mut overview = BrokerOverview::new("b1", "b1");
        overview.total_connections = connections;
        for i in 0..destinations {
            overview.add_destination(DestinationOverview::new(Destination::queue(format!("q{}", i))));
        }
        overview
    }

    #[test]
    fn broker_limits_boundaries() {
        let policy = policy();
        assert!(!policy.broker_limits_exceeded(&with_destinations(19, 0)));
        assert!(!policy.broker_limits_exceeded(&with_destinations(20, 0)));
        assert!(policy.broker_limits_exceeded(&with_destinations(21, 0)));

        assert!(!policy.broker_limits_exceeded(&with_destinations(0, 9)));
        assert!(!policy.broker_limits_exceeded(&with_destinations(0, 10)));
        assert!(policy.broker_limits_exceeded(&with_destinations(0, 11)));
    }

    #[test]
    fn destination_limits_boundaries() {
        let policy = policy();
        for (depth, producers, consumers, exceeded) in [
            (99, 0, 0, false),
            (100, 5, 5, false),
            (101, 0, 0, true),
            (0, 6, 0, true),
            (0, 0, 6, true),
            (0, 4, 4, false),
        ] {
            let mut overview = BrokerOverview::new("b1", "b1");
            overview.add_destination(DestinationOverview::with_counters(
                Destination::queue("q"),
                depth,
                producers,
                consumers,
            ));
            assert_eq!(
                policy.destination_limits_exceeded(&overview),
                exceeded,
                "depth={} producers={} consumers={}",
                depth,
                producers,
                consumers
            );
        }
    }

    #[test]
    fn load_is_weighted_percentage() {
        let policy = policy();
        // 10/20 connections = 50% * 0.8 = 40, 5/10 destinations = 50% * 0.2 = 10
        assert_eq!(policy.load(&with_destinations(10, 5)), 50);
        assert_eq!(policy.load(&with_destinations(0, 0)), 0);
        assert_eq!(policy.load(&with_destinations(20, 10)), 100);
    }

    #[test]
    fn load_is_monotonic_in_both_inputs() {
        let policy = policy();
        let mut previous = 0;
        for connections in 0..30 {
            let load = policy.load(&with_destinations(connections, 3));
            assert!(load >= previous);
            previous = load;
        }
        previous = 0;
        for destinations in 0..15 {
            let load = policy.load(&with_destinations(4, destinations));
            assert!(load >= previous);
            previous = load;
        }
    }
}
